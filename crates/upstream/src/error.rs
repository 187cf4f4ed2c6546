//! Validation probe errors

/// Why a validation probe could not confirm a credential.
///
/// Only surfaces inside probe implementations and their logs: the `Probe`
/// contract turns every variant into `false`.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("probe transport failed: {0}")]
    Transport(String),

    #[error("probe rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },
}
