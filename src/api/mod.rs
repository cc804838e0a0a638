//! Versioned inspection of published frames.
//!
//! A caller names the version it speaks with an [`ApiVersion`]. Each version
//! owns its response struct and the translation from a resolved [`Frame`]
//! into it. The frame is resolved once through the directory and handed to
//! the translation by reference, so one response always describes one frame.
use crate::cloud::Cloud;
use crate::error::LiquidError;
use crate::frame::frame::Frame;
use crate::kv::Key;
use log::debug;
use serde::Serialize;

mod schemas;

pub use schemas::{ColV1, ColV2, FrameV1, FrameV2};

/// The versions of the inspection api that are served
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ApiVersion {
    V1,
    V2,
}

impl TryFrom<u32> for ApiVersion {
    type Error = LiquidError;

    fn try_from(version: u32) -> Result<Self, Self::Error> {
        match version {
            1 => Ok(ApiVersion::V1),
            2 => Ok(ApiVersion::V2),
            v => Err(LiquidError::UnsupportedVersion(v)),
        }
    }
}

/// A request to inspect the frame published under `key`
#[derive(Clone, Debug, PartialEq)]
pub struct InspectRequest {
    pub version: ApiVersion,
    pub key: Key,
    /// The 1-based first row of the data window, `0` means `1`
    pub offset: u64,
    /// The number of rows of the data window, `0` means 100
    pub len: usize,
}

impl InspectRequest {
    /// A request for the default window of the frame under `key`
    pub fn new(version: ApiVersion, key: Key) -> Self {
        InspectRequest {
            version,
            key,
            offset: 0,
            len: 0,
        }
    }
}

/// An inspection response, in the version that was asked for
#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(untagged)]
pub enum Inspection {
    V1(FrameV1),
    V2(FrameV2),
}

/// Answers `request`
///
/// ## Errors
/// `NotPresent` if no frame is published under the requested key.
pub async fn inspect(cloud: &Cloud, request: &InspectRequest) -> Result<Inspection, LiquidError> {
    let frame: Frame = cloud
        .get_frame(&request.key)
        .await?
        .ok_or_else(|| LiquidError::NotPresent(request.key.clone()))?;
    debug!("Inspecting {} as {:?}", frame.key, request.version);
    match request.version {
        ApiVersion::V1 => Ok(Inspection::V1(FrameV1::fill(cloud, &frame).await?)),
        ApiVersion::V2 => Ok(Inspection::V2(
            FrameV2::fill(cloud, &frame, request.offset, request.len).await?,
        )),
    }
}
