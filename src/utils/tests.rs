use super::error::{Error, ErrorCode};
use super::logging;
use crate::transport::close::CloseCode;

#[test]
fn logging_init_accepts_levels() {
    // Should not panic
    logging::init("info");
    logging::init("debug");
    logging::init("bogus");
}

#[test]
fn error_codes_follow_taxonomy() {
    assert_eq!(Error::invalid_argument("bad url").code(), 10);
    assert_eq!(
        Error::operation(ErrorCode::PublishDisallowed, "no").code(),
        12
    );
    assert_eq!(
        Error::connection(CloseCode::NotAuthenticated, "bad credentials").code(),
        4002
    );
    assert_eq!(Error::not_connected().code(), 1006);
}

#[test]
fn error_code_round_trips_through_u16() {
    for code in [
        ErrorCode::InvalidArgument,
        ErrorCode::PublishFailed,
        ErrorCode::SubscriptionInvalid,
        ErrorCode::RequestDisallowed,
    ] {
        assert_eq!(ErrorCode::try_from(code.as_u16()).unwrap(), code);
    }
    assert!(ErrorCode::try_from(999).is_err());
}

#[test]
fn reason_strips_code_prefix() {
    let err = Error::operation(ErrorCode::SubscriptionFailed, "server busy");
    assert_eq!(err.reason(), "server busy");
    assert!(err.to_string().contains("subscription failed (21)"));
}

#[test]
fn duplicate_preserves_code() {
    let err = Error::connection(CloseCode::Restart, "restarting");
    let copy = err.duplicate();
    assert_eq!(copy.code(), err.code());
    assert_eq!(copy.reason(), "restarting");
}
