// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Frame parsing stage of a set-top-box media player pipeline.
//!
//! This crate turns a stream of coded access units into a sequence of
//! decode-ordered, fully time-stamped frame descriptors handed to a decoder
//! stage, coping with trick-play in either direction, stream discontinuities
//! and malformed input while respecting hard limits on the number of
//! in-flight decode and reference buffers.
//!
//! The [`pipeline::FrameParser`] driver is generic over a codec frontend
//! implementing [`pipeline::CodecParser`]; the [`h264`] and [`mpeg2`] modules
//! provide the two frontends.

use thiserror::Error;

pub mod deferred;
pub mod frame;
pub mod h264;
pub mod mpeg2;
pub mod pipeline;
pub mod pool;
pub mod ports;
pub mod timing;

pub type Result<T> = std::result::Result<T, FrameParserError>;

#[derive(Error, Debug)]
pub enum FrameParserError {
    /// A malformed header was found. The offending access unit is dropped
    /// without being queued; parsing continues with the next unit.
    #[error("syntax error in coded frame headers")]
    HeaderSyntaxError,

    /// No sequence-level parameters have been seen yet. Expected during
    /// stream startup, not fatal.
    #[error("stream parameters have not been seen yet")]
    NoStreamParameters,

    /// The picture references a parameter set that has not been seen.
    #[error("picture parameter set {0} has not been seen")]
    NoPictureParameters(u8),

    /// A reorder dependency cannot be satisfied from the live reference set.
    /// Non-fatal; triggers the discarding state in reverse play.
    #[error("insufficient reference frames to satisfy prediction")]
    InsufficientReferenceFrames,

    /// The coded frame buffer pool is exhausted.
    #[error("failed to allocate a coded frame buffer")]
    FailedToAllocateBuffer,

    /// The stream is outside the supported envelope or unrecoverably broken.
    /// No further frames will be queued for it.
    #[error("stream has been marked unplayable")]
    StreamUnplayable,

    /// An internal invariant was violated.
    #[error("implementation error: {0}")]
    Implementation(&'static str),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

/// Direction the elementary stream is currently being played in.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum PlayDirection {
    #[default]
    Forward,
    Backward,
}

/// Format of the native timestamps carried on coded access units.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum TimeFormat {
    /// 90 kHz transport ticks.
    #[default]
    Pts90kHz,
    /// Plain microseconds.
    Microseconds,
}
