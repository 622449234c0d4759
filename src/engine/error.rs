use ulid::Ulid;

use crate::model::{Day, OrderStatus};

#[derive(Debug)]
pub enum EngineError {
    NotFound(&'static str, Ulid),
    AlreadyExists(&'static str, Ulid),
    EmailTaken(String),
    /// Unknown email or wrong password. The two are not told apart.
    InvalidCredentials,
    Unauthenticated,
    Forbidden(&'static str),
    Invalid(String),
    DateUnavailable(Day),
    DateAlreadyOpen(Day),
    DateNotOpen(Day),
    InvalidTransition {
        order: Ulid,
        from: OrderStatus,
        action: &'static str,
    },
    HasDependents(&'static str, Ulid),
    AlreadyVerified,
    NotVerified,
    OtpMismatch,
    OtpExpired,
    OtpAttemptsExhausted,
    ResetTokenInvalid,
    LimitExceeded(&'static str),
    Storage(String),
    Crypto(String),
    WalError(String),
}

impl EngineError {
    /// SQLSTATE reported to the client.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            EngineError::NotFound(..) | EngineError::DateNotOpen(_) => "P0002",
            EngineError::AlreadyExists(..)
            | EngineError::EmailTaken(_)
            | EngineError::DateAlreadyOpen(_) => "23505",
            EngineError::InvalidCredentials => "28P01",
            EngineError::Unauthenticated => "28000",
            EngineError::Forbidden(_) | EngineError::NotVerified => "42501",
            EngineError::Invalid(_)
            | EngineError::OtpMismatch
            | EngineError::OtpExpired
            | EngineError::ResetTokenInvalid => "22023",
            EngineError::DateUnavailable(_) => "23P01",
            EngineError::InvalidTransition { .. } | EngineError::AlreadyVerified => "55000",
            EngineError::HasDependents(..) => "23503",
            EngineError::OtpAttemptsExhausted | EngineError::LimitExceeded(_) => "54000",
            EngineError::Storage(_) | EngineError::WalError(_) => "58030",
            EngineError::Crypto(_) => "XX000",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(what, id) => write!(f, "{what} not found: {id}"),
            EngineError::AlreadyExists(what, id) => write!(f, "{what} already exists: {id}"),
            EngineError::EmailTaken(email) => write!(f, "email already registered: {email}"),
            EngineError::InvalidCredentials => write!(f, "invalid email or password"),
            EngineError::Unauthenticated => write!(f, "not logged in"),
            EngineError::Forbidden(msg) => write!(f, "forbidden: {msg}"),
            EngineError::Invalid(msg) => write!(f, "invalid input: {msg}"),
            EngineError::DateUnavailable(day) => write!(f, "date not available: {day}"),
            EngineError::DateAlreadyOpen(day) => write!(f, "date already opened: {day}"),
            EngineError::DateNotOpen(day) => write!(f, "date is not open: {day}"),
            EngineError::InvalidTransition { order, from, action } => {
                write!(f, "cannot {action} order {order} in status {}", from.as_str())
            }
            EngineError::HasDependents(what, id) => {
                write!(f, "cannot delete {what} {id}: still referenced")
            }
            EngineError::AlreadyVerified => write!(f, "user is already verified"),
            EngineError::NotVerified => write!(f, "account is not verified"),
            EngineError::OtpMismatch => write!(f, "OTP does not match"),
            EngineError::OtpExpired => write!(f, "OTP is expired, request a new one"),
            EngineError::OtpAttemptsExhausted => {
                write!(f, "too many OTP requests today, try again tomorrow")
            }
            EngineError::ResetTokenInvalid => write!(f, "reset token is invalid or expired"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Storage(e) => write!(f, "storage error: {e}"),
            EngineError::Crypto(e) => write!(f, "password hashing failed: {e}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
