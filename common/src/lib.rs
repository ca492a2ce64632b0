// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Facilities shared by the tape-library crates: typed identifiers, retry
//! policies, logging configuration and command-line plumbing.

pub mod backoff;
pub mod cmd;
pub mod logging;
pub mod typed_uuid;
