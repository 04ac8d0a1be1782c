//! User-facing prompt strings
//!
//! Maps status names and finger names to the messages a login flow
//! shows, with press and swipe phrasings.

/// Message for a non-final or no-match status event. Unknown names get
/// a generic retry prompt.
pub fn status_message(result: &str, is_swipe: bool) -> &'static str {
    match result {
        "verify-no-match" => "Failed to match fingerprint",
        "verify-swipe-too-short" => "Swipe was too short, try again",
        "verify-finger-not-centered" => "Finger was not centered, try again",
        "verify-remove-and-retry" => "Remove your finger, and try again",
        _ => {
            if is_swipe {
                "Swipe your finger again"
            } else {
                "Place your finger on the reader again"
            }
        }
    }
}

/// Prompt shown when the service announces which finger it selected.
///
/// `device_name` is included when the machine has more than one reader,
/// so the user knows which one to touch.
pub fn finger_prompt(finger: &str, device_name: Option<&str>, is_swipe: bool) -> String {
    let subject = match finger {
        "any" => "your finger".to_string(),
        name => format!("your {}", finger_display(name)),
    };

    match (is_swipe, device_name) {
        (true, Some(device)) => format!("Swipe {subject} across {device}"),
        (true, None) => format!("Swipe {subject} across the fingerprint reader"),
        (false, Some(device)) => format!("Place {subject} on {device}"),
        (false, None) => format!("Place {subject} on the fingerprint reader"),
    }
}

fn finger_display(name: &str) -> String {
    name.trim_end_matches("-finger").replace('-', " ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_messages() {
        assert_eq!(
            status_message("verify-swipe-too-short", true),
            "Swipe was too short, try again"
        );
        assert_eq!(
            status_message("verify-retry-scan", false),
            "Place your finger on the reader again"
        );
        assert_eq!(
            status_message("verify-retry-scan", true),
            "Swipe your finger again"
        );
    }

    #[test]
    fn finger_prompts() {
        assert_eq!(
            finger_prompt("any", None, false),
            "Place your finger on the fingerprint reader"
        );
        assert_eq!(
            finger_prompt("right-index-finger", None, true),
            "Swipe your right index across the fingerprint reader"
        );
        assert_eq!(
            finger_prompt("left-thumb", Some("Mock Sensor"), false),
            "Place your left thumb on Mock Sensor"
        );
    }
}
