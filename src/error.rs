use thiserror::Error;

/// Failures raised by probe modules. Everything here is either an
/// initialization-time configuration problem or a per-call build problem;
/// none of these may abort the process anywhere but `main`.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("malformed probe-args (expected \"hex:<digits>\"): {0}")]
    BadArgs(String),

    #[error("probe-args contain invalid hex: {0}")]
    BadHex(#[from] hex::FromHexError),

    #[error("tcp options are {0} bytes, must be a multiple of 4 (pad with NOPs, 0x01)")]
    UnalignedOptions(usize),

    #[error("tcp options are {0} bytes, maximum is {1}")]
    OversizedOptions(usize, usize),

    #[error("address family does not match probe module")]
    AddressFamily,

    #[error("packet buffer too small: need {need} bytes, have {have}")]
    BufferTooSmall { need: usize, have: usize },
}

/// Top-level error for initialization and worker threads; `main` is the
/// only place that turns one of these into a process exit.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("{0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Probe(#[from] ProbeError),

    #[error(transparent)]
    Target(#[from] TargetError),
}

/// Failures from the target enumerator. A parse failure means the input
/// source is corrupt, so callers treat it as fatal for the run.
#[derive(Debug, Error)]
pub enum TargetError {
    #[error("unable to read target file: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not parse address on line {line}: {text:?}")]
    Parse { line: usize, text: String },
}
