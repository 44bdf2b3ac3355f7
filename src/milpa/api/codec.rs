/*
 * Copyright (C) 2026 The Milpa Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::error::Error;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::milpa::api::types::MilpaObject;

/// Major versions must match exactly; minor revisions only add fields,
/// so any minor under a known major decodes.
pub const WIRE_MAJOR_VERSION: u32 = 1;
pub const WIRE_MINOR_VERSION: u32 = 2;
const CONTENT_TYPE_JSON: &str = "application/json";

#[derive(Debug, PartialEq, Eq)]
pub enum CodecError {
    IncompatibleVersion { found: String },
    Malformed(String),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::IncompatibleVersion { found } => write!(
                f,
                "incompatible wire version {} (supported major v{})",
                found, WIRE_MAJOR_VERSION
            ),
            CodecError::Malformed(message) => write!(f, "malformed frame: {}", message),
        }
    }
}

impl Error for CodecError {}

#[derive(Serialize, Deserialize)]
struct Frame {
    #[serde(rename = "wireVersion")]
    wire_version: String,
    #[serde(rename = "contentType")]
    content_type: String,
    payload: MilpaObject,
}

/// Frames every stored object as `{wireVersion, contentType, payload}`.
/// The payload's `kind` tag selects the concrete decoder.
#[derive(Debug, Clone, Copy, Default)]
pub struct VersioningCodec;

impl VersioningCodec {
    pub fn encode(&self, object: &MilpaObject) -> Result<Vec<u8>, CodecError> {
        let frame = Frame {
            wire_version: format!("v{}.{}", WIRE_MAJOR_VERSION, WIRE_MINOR_VERSION),
            content_type: CONTENT_TYPE_JSON.to_string(),
            payload: object.clone(),
        };
        serde_json::to_vec(&frame).map_err(|e| CodecError::Malformed(e.to_string()))
    }

    pub fn decode(&self, data: &[u8]) -> Result<MilpaObject, CodecError> {
        let frame: Frame =
            serde_json::from_slice(data).map_err(|e| CodecError::Malformed(e.to_string()))?;
        if frame.content_type != CONTENT_TYPE_JSON {
            return Err(CodecError::Malformed(format!(
                "unsupported content type {:?}",
                frame.content_type
            )));
        }
        let (major, _minor) = parse_wire_version(&frame.wire_version)?;
        if major != WIRE_MAJOR_VERSION {
            return Err(CodecError::IncompatibleVersion {
                found: frame.wire_version,
            });
        }
        Ok(frame.payload)
    }
}

fn parse_wire_version(version: &str) -> Result<(u32, u32), CodecError> {
    let malformed = || CodecError::Malformed(format!("bad wire version {version:?}"));
    let rest = version.strip_prefix('v').ok_or_else(malformed)?;
    let (major, minor) = rest.split_once('.').ok_or_else(malformed)?;
    Ok((
        major.parse().map_err(|_| malformed())?,
        minor.parse().map_err(|_| malformed())?,
    ))
}
