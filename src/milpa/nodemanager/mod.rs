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

pub mod controller;
pub mod dispenser;
pub mod scaler;

pub use controller::{NodeController, NodeControllerConfig};
pub use dispenser::{NodeDispenser, NodeReply, NodeRequest, NodeReturn};
pub use scaler::{BindingNodeScaler, NodeBucket, ScalePlan, StandbySpec};
