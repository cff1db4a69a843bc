// ── Status types ──

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Device liveness state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DeviceStatus {
    Online,
    Offline,
    Sleep,
}

/// Response codes exchanged with devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum StatusCode {
    #[strum(serialize = "OK")]
    Ok,
    Created,
    Deleted,
    Changed,
    Content,
    BadRequest,
    Unauthorized,
    NotFound,
    MethodNotAllowed,
    Timeout,
    Conflict,
    InternalServerError,
}

impl StatusCode {
    pub fn code(self) -> u16 {
        match self {
            Self::Ok => 200,
            Self::Created => 201,
            Self::Deleted => 202,
            Self::Changed => 204,
            Self::Content => 205,
            Self::BadRequest => 400,
            Self::Unauthorized => 401,
            Self::NotFound => 404,
            Self::MethodNotAllowed => 405,
            Self::Timeout => 408,
            Self::Conflict => 409,
            Self::InternalServerError => 500,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        Some(match code {
            200 => Self::Ok,
            201 => Self::Created,
            202 => Self::Deleted,
            204 => Self::Changed,
            205 => Self::Content,
            400 => Self::BadRequest,
            401 => Self::Unauthorized,
            404 => Self::NotFound,
            405 => Self::MethodNotAllowed,
            408 => Self::Timeout,
            409 => Self::Conflict,
            500 => Self::InternalServerError,
            _ => return None,
        })
    }

    /// 2xx-class codes that carry a usable result.
    pub fn is_good(self) -> bool {
        matches!(
            self,
            Self::Ok | Self::Created | Self::Deleted | Self::Changed | Self::Content
        )
    }
}

impl Serialize for StatusCode {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u16(self.code())
    }
}

impl<'de> Deserialize<'de> for StatusCode {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = u16::deserialize(deserializer)?;
        Self::from_code(code)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown status code {code}")))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn good_codes_are_the_2xx_set() {
        let good: Vec<u16> = [200, 201, 202, 204, 205, 400, 404, 408, 409, 500]
            .into_iter()
            .filter(|c| StatusCode::from_code(*c).unwrap().is_good())
            .collect();
        assert_eq!(good, vec![200, 201, 202, 204, 205]);
    }

    #[test]
    fn status_code_serializes_numerically() {
        assert_eq!(serde_json::to_string(&StatusCode::Changed).unwrap(), "204");
        let code: StatusCode = serde_json::from_str("409").unwrap();
        assert_eq!(code, StatusCode::Conflict);
        assert!(serde_json::from_str::<StatusCode>("299").is_err());
    }

    #[test]
    fn device_status_parses_lowercase() {
        assert_eq!("sleep".parse::<DeviceStatus>().unwrap(), DeviceStatus::Sleep);
        assert_eq!(DeviceStatus::Offline.to_string(), "offline");
    }
}
