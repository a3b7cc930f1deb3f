//! Error taxonomy for the acquisition engine.
//!
//! `AcqError` consolidates every failure mode the pipeline can observe, each
//! tagged with the recovery strategy the engine actually applies so that a
//! reader does not have to cross-reference the design doc to know whether a
//! given error drops a frame, aborts the run, or rejects a setter outright.

use thiserror::Error;

/// Convenience alias for results returned by this crate.
pub type AcqResult<T> = std::result::Result<T, AcqError>;

/// Every failure mode the acquisition pipeline can observe.
#[derive(Error, Debug)]
pub enum AcqError {
    /// The device itself has failed: a null `frame_info` reached the EOF
    /// callback, `start_exp` failed, or `setup_exp` failed.
    ///
    /// **Recovery**: `request_abort(preserve_buffered = true)`; the engine
    /// stops and prints the end-of-run summary.
    #[error("device fatal error: {0}")]
    DeviceFatal(String),

    /// Deep-copying a frame out of the device ring failed (I/O-level
    /// failure on the driver side, not a staleness race).
    ///
    /// **Recovery**: drop the frame, count it as lost, then escalate to
    /// `request_abort(preserve_buffered = true)` — this is not a
    /// recoverable per-frame condition.
    #[error("frame copy failed for frame {frame_nr}: {reason}")]
    FrameCopyFail {
        /// The frame number that failed to copy.
        frame_nr: u32,
        /// Driver-reported reason.
        reason: String,
    },

    /// The device ring overwrote a frame before the acquisition worker
    /// could deep-copy it out.
    ///
    /// **Recovery**: drop, count as lost, continue. Never escalates.
    #[error("frame {frame_nr} went stale before copy (latest received {latest_received})")]
    FrameStale {
        /// The stale frame's number.
        frame_nr: u32,
        /// The most recent frame number the engine had already seen.
        latest_received: u32,
    },

    /// A frame arrived with `frame_nr <= last_processed`: either a replay
    /// or an out-of-order delivery from the driver.
    ///
    /// **Recovery**: drop, bump `out_of_order`, continue. Never escalates.
    #[error("frame {frame_nr} is not after last processed frame {last_processed}")]
    FrameOutOfOrder {
        /// The offending frame's number.
        frame_nr: u32,
        /// The last frame number successfully processed.
        last_processed: u32,
    },

    /// Q1 or Q2 was full at push time.
    ///
    /// **Recovery**: drop per the queue's configured policy, bump the
    /// relevant lost counter, continue. Never escalates.
    #[error("queue '{queue}' overflowed (capacity {capacity})")]
    QueueOverflow {
        /// Which queue overflowed ("Q1" or "Q2").
        queue: &'static str,
        /// The queue's configured capacity.
        capacity: usize,
    },

    /// Opening, writing, or closing an output file failed.
    ///
    /// **Recovery**: `request_abort(preserve_buffered = true)`; the engine
    /// never retries a file write.
    #[error("file I/O error on {path}: {source}")]
    FileIo {
        /// The path the engine was writing to.
        path: std::path::PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// `max_stack_size` was configured below 2, which cannot hold even a
    /// minimal stack.
    ///
    /// **Recovery**: setup refuses to start; the caller must fix the
    /// setting and retry.
    #[error("max_stack_size {0} is too small to hold at least 2 frames")]
    StackTooSmall(u32),

    /// Parsing the embedded per-frame metadata failed.
    ///
    /// **Recovery**: invalidate the frame, drop it, continue. The first 32
    /// bytes of the raw buffer are logged alongside this error.
    #[error("metadata corrupt for frame {frame_nr}: {reason}")]
    MetadataCorrupt {
        /// The affected frame's number.
        frame_nr: u32,
        /// What went wrong while parsing.
        reason: String,
    },

    /// A setter rejected an invalid value (unknown exposure resolution,
    /// mismatched ROI binning, zero frame size, etc).
    ///
    /// **Recovery**: the setter returns this error immediately; no state
    /// changes.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Wraps `std::io::Error` for the ambient configuration/CLI layer.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Wraps `config::ConfigError` for the layered configuration loader.
    #[error(transparent)]
    Config(#[from] config::ConfigError),
}
