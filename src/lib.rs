//! # Persistit - Embedded Transactional Key-Value Storage
//!
//! Persistit is an embedded, transactional, ordered key-value storage
//! engine. Data lives in paged B+-tree files ("volumes") backed by a
//! write-ahead journal that serves as redo log, page-image cache, and
//! crash-recovery checkpoint stream.
//!
//! ## Quick Start
//!
//! ```no_run
//! use persistit::{Configuration, Direction, Persistit};
//!
//! let mut config = Configuration::default();
//! config.journal_path = "data".into();
//! config.buffer_pools = vec![(4096, 512)];
//! config.volumes = vec!["data/main.v01,create,bufferSize:4096,initialPages:16".into()];
//!
//! let db = Persistit::open(config)?;
//! let mut ex = db.exchange("main", "greetings", true)?;
//!
//! // Transactional write.
//! let mut tx = db.begin()?;
//! ex.key.clear().append_str("hello")?;
//! ex.value.put_str("world");
//! ex.store(Some(&mut tx))?;
//! tx.commit()?;
//!
//! // Ordered traversal.
//! ex.key.clear();
//! while ex.traverse(Direction::Gt, None, None)? {
//!     println!("{:?} = {:?}", ex.key, ex.value.as_bytes());
//! }
//! db.close()?;
//! # Ok::<(), persistit::PersistitError>(())
//! ```
//!
//! ## Architecture
//!
//! - **Page codec**: bit-exact layout with prefix-compressed key blocks
//! - **Buffer pool**: latched frames with counted reader and exclusive
//!   writer claims
//! - **Volume store**: page allocation, garbage chains, tree directory
//! - **Journal**: append-only record stream with background flusher and
//!   copier
//! - **Transactions**: MVCC with commit-timestamp ordering and pruning
//! - **Recovery**: keystone discovery and two-phase replay

pub mod config;
pub mod db;
pub mod error;
pub mod exchange;
pub mod iometer;
pub mod journal;
pub mod key;
pub mod keyfilter;
pub mod logging;
pub mod management;
pub mod mvv;
pub mod page;
pub mod pool;
pub mod recovery;
pub mod transaction;
pub mod tree;
pub mod value;
pub mod volume;

pub use crate::config::{CommitPolicy, Configuration, VolumeSpecification};
pub use crate::db::Persistit;
pub use crate::error::{PersistitError, Result};
pub use crate::exchange::{Direction, Exchange};
pub use crate::key::{Key, KeySegment};
pub use crate::keyfilter::KeyFilter;
pub use crate::transaction::accumulator::AccumulatorType;
pub use crate::transaction::{Transaction, TxState};
pub use crate::value::Value;
pub use crate::volume::Volume;
