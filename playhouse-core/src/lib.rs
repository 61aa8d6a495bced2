/*
 * Copyright (c) 2024, United States Government, as represented by the
 * Administrator of the National Aeronautics and Space Administration.
 * All rights reserved.
 *
 * The ODIN - Open Data Integration Framework is licensed under the
 * Apache License, Version 2.0 (the "License"); you may not use this file
 * except in compliance with the License. You may obtain a copy of the
 * License at http://www.apache.org/licenses/LICENSE-2.0.
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */
//! Runtime shared by every PlayHouse server process: actor/stage lifecycle,
//! the send/request API, and the per-stage event loop.

pub mod prelude;
pub mod log;

pub mod actor;
pub mod errors;
pub mod request_cache;
pub mod sender;
pub mod stage;
pub mod timer;

pub use actor::{Actor, ActorFactory, IActor};
pub use errors::{error_code, PlayCoreError, Result};
pub use request_cache::{RequestCache, RequestHandle};
pub use sender::{ActorSender, ApiSender, ClientLink, MeshLink, MeshSender, SendPolicy, ServiceRegistry, StageSender};
pub use stage::{IStage, Stage, StagePool, StageState};
pub use timer::{StageTimers, TimerHandle};
