//! Result validators of the session operations

use serde::{Deserialize, Serialize};

use crate::error::OperationError;

/// Result of externalCallLib
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalCallResult {
    pub sum: u64,
    pub found: Option<String>,
}

/// Accepts any payload
pub fn ignore_result(_result: Option<String>) -> Result<(), OperationError> {
    Ok(())
}

/// delayedSum must deliver a number
pub fn parse_number(result: Option<String>) -> Result<i64, OperationError> {
    let raw = result
        .ok_or_else(|| OperationError::Validation("delayedSum should return number type".into()))?;
    serde_json::from_str::<i64>(&raw).map_err(|_| {
        OperationError::Validation(format!(
            "delayedSum should return number type; received: {}",
            raw
        ))
    })
}

/// externalCallLib delivers a two element array `[sum, found]`
pub fn parse_external_call_result(
    result: Option<String>,
) -> Result<ExternalCallResult, OperationError> {
    let parse_error = |message: String| OperationError::Parse {
        alias: "ExternalCallLib".to_string(),
        message,
    };
    let raw = result.ok_or_else(|| parse_error("result is empty".to_string()))?;
    let (sum, found) = serde_json::from_str::<(u64, Option<String>)>(&raw)
        .map_err(|err| parse_error(format!("{} ({})", err, raw)))?;
    Ok(ExternalCallResult { sum, found })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_number() {
        assert_eq!(parse_number(Some("100".into())).unwrap(), 100);
        assert_eq!(parse_number(Some("-3".into())).unwrap(), -3);
        assert!(matches!(
            parse_number(Some("\"abc\"".into())),
            Err(OperationError::Validation(_))
        ));
        assert!(matches!(parse_number(None), Err(OperationError::Validation(_))));
    }

    #[test]
    fn test_parse_external_call_result() {
        assert_eq!(
            parse_external_call_result(Some("[8, \"two\"]".into())).unwrap(),
            ExternalCallResult {
                sum: 8,
                found: Some("two".into())
            }
        );
        assert_eq!(
            parse_external_call_result(Some("[8, null]".into())).unwrap(),
            ExternalCallResult { sum: 8, found: None }
        );
        for bad in ["{}", "[8]", "[8, \"two\", 3]", "oops"] {
            assert!(
                matches!(
                    parse_external_call_result(Some(bad.into())),
                    Err(OperationError::Parse { .. })
                ),
                "{} should not parse",
                bad
            );
        }
        assert!(parse_external_call_result(None).is_err());
    }
}
