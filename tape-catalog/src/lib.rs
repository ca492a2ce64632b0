// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Persistent tape catalog and durable work queues.
//!
//! Both live in one SQLite database opened through [`CatalogStore`].  Tape
//! records are guarded by an optimistic version counter; queue entries are
//! leased with a single conditional update so that at most one consumer
//! holds a given entry.

mod criteria;
mod error;
mod inventory;
mod model;
mod queue;
mod store;

pub use criteria::{FilterValue, PayloadFilter, TapeCriteria};
pub use error::Error;
pub use inventory::{RetryUpdate, TapeInventory};
pub use model::{
    QueueEntry, QueueMessage, QueueMessageType, QueueState, QueueStats,
    ReadOrder, TapeCatalog, TapeCatalogUpdate, TapeLocation, TapeLocationType,
    TapeState, WriteOrder,
};
pub use queue::{DurableQueue, ReceiveOptions};
pub use store::{CatalogConfig, CatalogStore};
