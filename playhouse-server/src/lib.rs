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

//! Composition roots for the two PlayHouse server process kinds (spec §4.12,
//! C14): a Play server (client transports + stage pool) and an API server
//! (stateless handler dispatch), each bootstrapped from a builder that
//! registers stage types/controllers before bringing every subsystem up in
//! the order spec.md gives.

pub mod api_dispatcher;
pub mod api_server;
pub mod cli;
pub mod config;
pub mod errors;
pub mod play_server;
pub mod router;
pub mod session;
pub mod transport;

pub mod prelude;
