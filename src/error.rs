// src/error.rs
// Error taxonomy shared by the matcher, request ledger, agreement machine and anchoring path

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

/// How a caller should treat a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad input. Never retried.
    Validation,
    /// Caller is not allowed to act on the record. Never retried.
    Authorization,
    /// Racing or stale caller. Re-query state and retry the whole operation.
    Conflict,
    NotFound,
    /// Infrastructure failure. Retried by the anchor queue with backoff.
    Transient,
}

/// Failures raised by a ledger strategy during `commit`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("ledger call timed out after {0}ms")]
    Timeout(u64),

    #[error("ledger network error: {0}")]
    Network(String),

    #[error("ledger rejected signing credential: {0}")]
    Credential(String),

    #[error("ledger rejected transaction: {0}")]
    Rejected(String),

    #[error("local ledger storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("could not encode ledger request: {0}")]
    Encoding(String),
}

impl LedgerError {
    /// Timeouts, network blips and local storage hiccups are worth another attempt.
    /// A refused credential or a rejected transaction will fail the same way again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LedgerError::Timeout(_) | LedgerError::Network(_) | LedgerError::StorageUnavailable(_)
        )
    }
}

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("land size must be positive (got {0})")]
    InvalidLandSize(f64),

    #[error("document content id is required before anchoring")]
    MissingDocument,

    #[error("agreement data incomplete: {0}")]
    IncompleteAgreementData(String),

    #[error("a farmer cannot send an integration request to themselves")]
    SelfRequest,

    #[error("integration period end must be after its start")]
    InvalidIntegrationPeriod,

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("{0}")]
    NotAuthorized(String),

    #[error("farmer {farmer_id} is not a party to agreement {agreement_id}")]
    NotAParty {
        agreement_id: String,
        farmer_id: String,
    },

    #[error("parcel {0} is not eligible for integration")]
    NotEligible(String),

    #[error("a pending request already exists for this farmer and parcel pair")]
    DuplicatePending,

    #[error("request {0} was already resolved")]
    AlreadyResolved(String),

    #[error("agreement {agreement_id}: cannot {action} from state {from}")]
    InvalidTransition {
        agreement_id: String,
        from: String,
        action: &'static str,
    },

    #[error("agreement {0} is not anchoring")]
    NotAnchoring(String),

    #[error("a ledger commit for agreement {0} is still in flight")]
    AnchoringInFlight(String),

    #[error("parcel {0} is referenced by an active agreement")]
    ParcelLocked(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("anchoring of agreement {agreement_id} failed: {reason}")]
    AnchorFailed {
        agreement_id: String,
        reason: String,
    },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("anchor queue closed")]
    QueueClosed,
}

impl CoreError {
    /// Stable code used in API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::InvalidLandSize(_) => "InvalidLandSize",
            CoreError::MissingDocument => "MissingDocument",
            CoreError::IncompleteAgreementData(_) => "IncompleteAgreementData",
            CoreError::SelfRequest => "SelfRequest",
            CoreError::InvalidIntegrationPeriod => "InvalidIntegrationPeriod",
            CoreError::InvalidInput(_) => "InvalidInput",
            CoreError::NotAuthorized(_) => "NotAuthorized",
            CoreError::NotAParty { .. } => "NotAParty",
            CoreError::NotEligible(_) => "NotEligible",
            CoreError::DuplicatePending => "DuplicatePending",
            CoreError::AlreadyResolved(_) => "AlreadyResolved",
            CoreError::InvalidTransition { .. } => "InvalidTransition",
            CoreError::NotAnchoring(_) => "NotAnchoring",
            CoreError::AnchoringInFlight(_) => "AnchoringInFlight",
            CoreError::ParcelLocked(_) => "ParcelLocked",
            CoreError::NotFound(_) => "NotFound",
            CoreError::Ledger(_) => "LedgerError",
            CoreError::AnchorFailed { .. } => "AnchorFailed",
            CoreError::Storage(_) => "StorageUnavailable",
            CoreError::QueueClosed => "QueueClosed",
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            CoreError::InvalidLandSize(_)
            | CoreError::MissingDocument
            | CoreError::IncompleteAgreementData(_)
            | CoreError::SelfRequest
            | CoreError::InvalidIntegrationPeriod
            | CoreError::InvalidInput(_)
            | CoreError::NotEligible(_) => ErrorClass::Validation,
            CoreError::NotAuthorized(_) | CoreError::NotAParty { .. } => ErrorClass::Authorization,
            CoreError::DuplicatePending
            | CoreError::AlreadyResolved(_)
            | CoreError::InvalidTransition { .. }
            | CoreError::NotAnchoring(_)
            | CoreError::AnchoringInFlight(_)
            | CoreError::ParcelLocked(_) => ErrorClass::Conflict,
            CoreError::NotFound(_) => ErrorClass::NotFound,
            CoreError::Ledger(_)
            | CoreError::AnchorFailed { .. }
            | CoreError::Storage(_)
            | CoreError::QueueClosed => ErrorClass::Transient,
        }
    }
}
