//! Tag publication policy.
//!
//! A readable tag publishes its scaled value. A tag in noread rides out up
//! to `noread_ignore` failed reads silently, then applies its configured
//! noread action: do nothing, clear the retained message, or publish the
//! substitute noread value.

use crate::mqtt::MqttLink;

use super::cycle::UpdateCycle;
use super::registry::TagRegistry;
use super::tag::{NoreadAction, ReadTag};

pub fn publish_tag(mqtt: &MqttLink, tag: &ReadTag) {
    if !mqtt.is_connected() || tag.topic.is_empty() {
        return;
    }
    if !tag.in_noread() {
        mqtt.publish(
            &tag.topic,
            &render_value(&tag.format, tag.scaled_value()),
            tag.retain,
        );
        return;
    }
    if !tag.noread_ignore_exceeded() {
        return;
    }
    match tag.noread_action {
        NoreadAction::DoNothing => {}
        NoreadAction::ClearRetained => mqtt.clear_retained(&tag.topic),
        NoreadAction::PublishNoread => mqtt.publish(
            &tag.topic,
            &render_value(&tag.format, tag.noread_value),
            tag.retain,
        ),
    }
}

/// Shutdown sweep over every cycle-assigned tag: optionally publish the
/// noread value, optionally clear the retained message. Local publish tags
/// get their retained state cleared as well.
pub fn clear_all_tags(
    mqtt: &MqttLink,
    registry: &TagRegistry,
    cycles: &[UpdateCycle],
    publish_noread: bool,
    clear_retain: bool,
) {
    for cycle in cycles {
        for &index in &cycle.tag_indexes {
            let tag = &registry.read_tags[index];
            if tag.topic.is_empty() {
                continue;
            }
            log::debug!("clearing: {}", tag.topic);
            if publish_noread {
                mqtt.publish(
                    &tag.topic,
                    &render_value(&tag.format, tag.noread_value),
                    tag.retain,
                );
            }
            if clear_retain {
                mqtt.clear_retained(&tag.topic);
            }
        }
    }
    for tag in &registry.local_tags {
        if tag.publish_enabled {
            mqtt.clear_retained(&tag.topic);
        }
    }
}

/// Render a value through a printf-style format string.
///
/// Supports the conversions the tag configurations actually use: `%f`/`%F`
/// with optional precision (default 6), `%e`/`%E`, `%g`/`%G`, `%d`/`%i`/`%u`
/// (rounded), plus literal text around the conversion and `%%`. Anything
/// unrecognized falls back to the plain value.
pub fn render_value(format: &str, value: f64) -> String {
    let chars: Vec<char> = format.chars().collect();
    let mut out = String::with_capacity(format.len() + 8);
    let mut i = 0;
    let mut converted = false;
    while i < chars.len() {
        if chars[i] != '%' {
            out.push(chars[i]);
            i += 1;
            continue;
        }
        if i + 1 < chars.len() && chars[i + 1] == '%' {
            out.push('%');
            i += 2;
            continue;
        }
        // flags and width
        let mut j = i + 1;
        while j < chars.len()
            && (chars[j] == '-'
                || chars[j] == '+'
                || chars[j] == ' '
                || chars[j].is_ascii_digit())
        {
            j += 1;
        }
        let mut precision: Option<usize> = None;
        if j < chars.len() && chars[j] == '.' {
            j += 1;
            let mut digits = String::new();
            while j < chars.len() && chars[j].is_ascii_digit() {
                digits.push(chars[j]);
                j += 1;
            }
            precision = Some(digits.parse().unwrap_or(0));
        }
        let Some(&conversion) = chars.get(j) else {
            out.push('%');
            i += 1;
            continue;
        };
        match conversion {
            'f' | 'F' => out.push_str(&format!("{:.*}", precision.unwrap_or(6), value)),
            'e' | 'E' => out.push_str(&format!("{:.*e}", precision.unwrap_or(6), value)),
            'g' | 'G' => out.push_str(&format!("{value}")),
            'd' | 'i' | 'u' => out.push_str(&format!("{}", value.round() as i64)),
            _ => {
                // unknown directive, keep it verbatim
                for &c in &chars[i..=j] {
                    out.push(c);
                }
            }
        }
        converted = true;
        i = j + 1;
    }
    if !converted && out.is_empty() {
        return format!("{value}");
    }
    out
}
