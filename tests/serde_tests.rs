#![cfg(feature = "serde")]

use coefficient::{CompileError, ParseErrorKind};

#[test]
#[ntest::timeout(100)]
fn test_parse_error_kind_round_trips() {
    let kind = ParseErrorKind::UnclosedBlock { tag: '#' };
    let encoded = serde_json::to_string(&kind).unwrap();
    let decoded: ParseErrorKind = serde_json::from_str(&encoded).unwrap();
    assert_eq!(decoded, kind);
}

#[test]
#[ntest::timeout(100)]
fn test_compile_error_round_trips() {
    let err = CompileError::InvalidCondition {
        expression: "[a] &&".to_string(),
        message: "unexpected end of expression".to_string(),
    };
    let encoded = serde_json::to_string(&err).unwrap();
    let decoded: CompileError = serde_json::from_str(&encoded).unwrap();
    assert_eq!(decoded, err);
}
