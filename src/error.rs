#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Sample rate is invalid: {0}")]
    InvalidSampleRate(f32),
    #[error("Frame size ({0}) should be a non zero multiple of hop size ({1})")]
    InvalidFrameSize(usize, usize),
    #[error("Hop size is invalid: {0}")]
    InvalidHopSize(usize),
    #[error("Filter set is invalid: {0}")]
    InvalidFilterSet(&'static str),
    #[error("HRTF set is invalid: {0}")]
    InvalidHrtfSet(&'static str),
    #[error("Input/Output length ({0}) should be equal to block len ({1})")]
    InvalidInputOutputLen(usize, usize),
    #[error("Resampling failed: {0}")]
    Resample(String),
    #[error("The owls are not what they seem")]
    InternalProcessingError(#[from] realfft::FftError),
}

pub type Result<T> = std::result::Result<T, Error>;
