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

pub mod error;
pub mod retry;

use std::net::UdpSocket;

use rand::RngCore;

pub use error::{find_cause, new_error, with_context};

/// Random 128-bit identifier rendered as lowercase hex. Used for object
/// UIDs and the cluster controller ID.
pub fn random_uid() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Address the host uses for outbound traffic. No packets are sent; the
/// connect() only binds a route.
pub fn detect_internal_ip() -> Option<String> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:53").ok()?;
    socket.local_addr().ok().map(|addr| addr.ip().to_string())
}
