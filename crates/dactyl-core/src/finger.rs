//! Finger naming and storage codes

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One of the ten enrollable fingers.
///
/// The discriminant doubles as the one-hex-digit storage code used for
/// on-disk file names, so it is part of the persistence format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum Finger {
    LeftThumb = 1,
    LeftIndex = 2,
    LeftMiddle = 3,
    LeftRing = 4,
    LeftLittle = 5,
    RightThumb = 6,
    RightIndex = 7,
    RightMiddle = 8,
    RightRing = 9,
    RightLittle = 10,
}

pub const ALL_FINGERS: [Finger; 10] = [
    Finger::LeftThumb,
    Finger::LeftIndex,
    Finger::LeftMiddle,
    Finger::LeftRing,
    Finger::LeftLittle,
    Finger::RightThumb,
    Finger::RightIndex,
    Finger::RightMiddle,
    Finger::RightRing,
    Finger::RightLittle,
];

impl Finger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Finger::LeftThumb => "left-thumb",
            Finger::LeftIndex => "left-index-finger",
            Finger::LeftMiddle => "left-middle-finger",
            Finger::LeftRing => "left-ring-finger",
            Finger::LeftLittle => "left-little-finger",
            Finger::RightThumb => "right-thumb",
            Finger::RightIndex => "right-index-finger",
            Finger::RightMiddle => "right-middle-finger",
            Finger::RightRing => "right-ring-finger",
            Finger::RightLittle => "right-little-finger",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        ALL_FINGERS.iter().copied().find(|f| f.as_str() == name)
    }

    /// One-hex-digit storage code ("1" through "a").
    pub fn code(&self) -> String {
        format!("{:x}", *self as u8)
    }

    pub fn from_code(code: &str) -> Option<Self> {
        if code.len() != 1 {
            return None;
        }
        let val = u8::from_str_radix(code, 16).ok()?;
        ALL_FINGERS.iter().copied().find(|f| *f as u8 == val)
    }
}

impl std::fmt::Display for Finger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A finger argument as received over the wire.
///
/// Verification accepts "any" (or an empty or unrecognized name) and
/// lets the device pick; enrollment requires a concrete finger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FingerRequest {
    Any,
    Specific(Finger),
}

impl FingerRequest {
    /// Lenient parse used by verification: anything that is not a known
    /// finger name means "any".
    pub fn parse(name: &str) -> Self {
        if name.is_empty() || name == "any" {
            return FingerRequest::Any;
        }
        match Finger::parse(name) {
            Some(finger) => FingerRequest::Specific(finger),
            None => FingerRequest::Any,
        }
    }

    /// Strict parse used by enrollment: the name must resolve to a
    /// concrete finger.
    pub fn parse_specific(name: &str) -> Result<Finger> {
        match FingerRequest::parse(name) {
            FingerRequest::Specific(finger) => Ok(finger),
            FingerRequest::Any => Err(Error::InvalidFingerName),
        }
    }

    /// Wire name for the finger-selected signal ("any" when the device
    /// is identifying against a gallery).
    pub fn as_str(&self) -> &'static str {
        match self {
            FingerRequest::Any => "any",
            FingerRequest::Specific(finger) => finger.as_str(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip() {
        for finger in ALL_FINGERS {
            assert_eq!(Finger::parse(finger.as_str()), Some(finger));
            assert_eq!(Finger::from_code(&finger.code()), Some(finger));
        }
    }

    #[test]
    fn codes_are_single_hex_digits() {
        assert_eq!(Finger::LeftThumb.code(), "1");
        assert_eq!(Finger::RightLittle.code(), "a");
        assert_eq!(Finger::from_code("b"), None);
        assert_eq!(Finger::from_code("10"), None);
    }

    #[test]
    fn request_parsing_is_lenient_for_verify() {
        assert_eq!(FingerRequest::parse(""), FingerRequest::Any);
        assert_eq!(FingerRequest::parse("any"), FingerRequest::Any);
        assert_eq!(FingerRequest::parse("no-such-finger"), FingerRequest::Any);
        assert_eq!(
            FingerRequest::parse("right-index-finger"),
            FingerRequest::Specific(Finger::RightIndex)
        );
    }

    #[test]
    fn enroll_requires_a_concrete_finger() {
        assert!(FingerRequest::parse_specific("any").is_err());
        assert!(FingerRequest::parse_specific("bogus").is_err());
        assert_eq!(
            FingerRequest::parse_specific("left-thumb").unwrap(),
            Finger::LeftThumb
        );
    }
}
