//! # Sphar
//!
//! Spherical harmonic and binaural audio processing
//!
//! This crate provides frame based real-time components working on
//! Ambisonic (spherical harmonic domain) and binaural signals:
//!
//! - [`rotator`] rotates a sound field given as yaw/pitch/roll or a quaternion
//! - [`beamformer`] steers cardioid, hypercardioid or max-rE beams
//! - [`binauraliser`] renders point sources over headphones with interpolated
//!   HRTFs and optional near-field correction
//! - [`multiconv`] convolves each channel with its own FIR filter, using
//!   the uniformly partitioned algorithm of the [`conv`] module
//!
//! Components process fixed size frames through the [`FrameProcessor`]
//! trait. A [`Fifo`] adapts host blocks of any length. Parameters are set
//! through a shared handle from any thread and take effect at the start of
//! the next processing call.
//!
//! [`FrameProcessor`]: `crate::fifo::FrameProcessor`
//! [`Fifo`]: `crate::fifo::Fifo`
//!
//! # Example
//!
//! ```no_run
//!
//! use sphar::fifo::Fifo;
//! use sphar::rotator::Rotator;
//!
//! let mut rotator = Rotator::builder()
//!     .with_order(3)
//!     .with_frame_size(128)
//!     .build()
//!     .unwrap();
//!
//! // the handle can be moved to a control thread
//! let params = rotator.params();
//! params.set_yaw(90.0);
//!
//! let mut fifo = Fifo::for_processor(&rotator);
//!
//! let input = vec![vec![0.0; 441]; 16];
//! let mut output = vec![vec![0.0; 441]; 16];
//!
//! // read_input()
//!
//! fifo.process_block(&mut rotator, &input, &mut output, 441, true);
//! ```

pub mod beamformer;
pub mod binauraliser;
pub mod buffer;
pub mod conv;
pub mod convention;
pub mod error;
pub mod fifo;
pub mod gate;
pub mod hrtf;
pub mod multiconv;
pub mod nearfield;
pub mod resample;
pub mod rotation;
pub mod rotator;
pub mod sh;
pub mod stft;

pub use error::{Error, Result};
