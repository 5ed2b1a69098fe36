// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]

//! # vmscope
//!
//! Virtual machine introspection for x86 guests: observe and interpret the memory and register
//! state of a running guest from the host, without guest cooperation.
//!
//! ## Features
//!
//! - **Typed guest memory overlays** - [`memory::GuestPtr`] gives bounds-checked, lazily fetched,
//!   write-back views over guest physical or virtual memory
//! - **Page-table walking** - 32-bit, PAE and long mode guests, including large pages
//! - **Event model** - VM exits as a closed set of [`event::EventDetail`] variants with
//!   capability queries
//! - **Implicit event context** - the event being handled is reachable from anywhere on the
//!   handling thread through [`event::context`]
//! - **Backend resolution** - [`hypervisor::instance`] probes the registered backends once and
//!   caches the first that attaches
//! - **Windows overlays** - PE section headers and CryptoAPI key BLOBs, validated against
//!   guest-controlled lengths
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use vmscope::prelude::*;
//!
//! // An in-memory guest with a NUL-terminated string at 0x1000
//! let snapshot = SnapshotMemory::with_data(0x1000, b"ntoskrnl.exe\0")?;
//! let memory = GuestMemory::new(Arc::new(snapshot), MemoryConfig::default());
//!
//! let name = memory.cstring(GuestPhysicalAddress::new(0x1000))?;
//! assert_eq!(name.to_string_lossy()?, "ntoskrnl.exe");
//!
//! // Overlays never read past their bound
//! assert!(matches!(name.get(64), Err(Error::OutOfBounds)));
//! # Ok::<(), vmscope::Error>(())
//! ```
//!
//! ## Architecture
//!
//! - [`memory`] - Guest addresses, the memory-access channel contract and typed overlays
//! - [`arch`] - x86 registers, segments, exception vectors and paging
//! - [`event`] - Events, callbacks, the thread-local event context and per-VCPU dispatch
//! - [`hypervisor`] - Backend traits, the snapshot backend and backend resolution
//! - [`windows`] - Windows structure overlays
//! - [`config`] - Limits and backend selection
//! - [`Error`] and [`Result`] - Error handling
//!
//! ## Error Handling
//!
//! Failures to read guest memory are never turned into zero values. Callers can distinguish
//! unreadable memory ([`Error::MemoryAccess`]) from memory whose contents are inconsistent
//! ([`Error::Malformed`]) and from contract violations ([`Error::InvalidMethod`]).
//!
//! ```rust,no_run
//! use vmscope::{hypervisor, Error};
//!
//! match hypervisor::instance() {
//!     Ok(hv) => println!("{} {}", hv.name(), hv.version()),
//!     Err(Error::UnsupportedHypervisor(reason)) => eprintln!("no backend: {reason}"),
//!     Err(e) => eprintln!("{e}"),
//! }
//! ```
//!
//! ## Logging
//!
//! Diagnostics go through the [`log`](https://docs.rs/log) facade. The library never installs
//! a logger.
#[macro_use]
pub(crate) mod macros;

#[macro_use]
pub(crate) mod error;

/// Convenient re-exports of the most commonly used types and traits.
///
/// # Example
///
/// ```rust
/// use vmscope::prelude::*;
///
/// let address = GuestPhysicalAddress::new(0x1000).offset(0x20)?;
/// assert_eq!(address.value(), 0x1020);
/// # Ok::<(), vmscope::Error>(())
/// ```
pub mod prelude;

/// x86 architectural state.
pub mod arch;

/// Limits, write policy and backend selection.
pub mod config;

/// Intercepted VM occurrences, their delivery and the thread-local event context.
pub mod event;

/// Hypervisor backends and backend resolution.
pub mod hypervisor;

/// Guest memory access.
///
/// # Key Types
///
/// - [`memory::GuestPtr`] - Typed overlay over a guest address range
/// - [`memory::MemoryChannel`] - Raw physical memory access provided by a backend
/// - [`memory::GuestMemory`] - A channel together with overlay limits
///
/// # Examples
///
/// ```rust
/// use std::sync::Arc;
/// use vmscope::memory::{GuestPhysicalAddress, GuestPtr, SnapshotMemory};
///
/// let snapshot = Arc::new(SnapshotMemory::with_data(0x2000, &[1, 0, 2, 0, 3, 0])?);
/// let words = GuestPtr::<u16>::new(snapshot, GuestPhysicalAddress::new(0x2000).into(), 3)?;
///
/// words.set(1, 0x20)?;
/// assert_eq!(words.read_all()?, vec![1, 0x20, 3]);
/// words.commit()?;
/// # Ok::<(), vmscope::Error>(())
/// ```
pub mod memory;

/// Windows structure overlays.
pub mod windows;

/// `vmscope` Result type
///
/// A type alias for [`std::result::Result<T, Error>`] where the error type is always [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// `vmscope` Error type
///
/// # Examples
///
/// ```rust
/// use vmscope::{event::context, Error};
///
/// context::clear();
/// assert!(matches!(context::get(), Err(Error::InvalidMethod(_))));
/// ```
pub use error::Error;

/// Failure reasons reported by memory-access channels and hypervisor resolution.
pub use error::{MemoryFault, UnsupportedReason};
