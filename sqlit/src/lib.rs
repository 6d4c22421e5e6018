//! # sqlit
//!
//! A unit-of-work ORM built on top of sqlx.
//!
//! A [`Schema`] describes tables, their foreign keys and unique keys. A
//! [`Database`] holds records of those tables in memory; assigning to a record
//! marks it dirty, and [`Database::flush`] writes every dirty record in one
//! transaction, parents before children, updating rows that already exist
//! instead of duplicating them.
//!
//! Filters are JSON documents compiled to SQL, so reads go through the same
//! schema: `{"user": {"email": "a@b.c"}, "total_gt": 10}` joins through the
//! `user` foreign key.
//!
//! ```rust,ignore
//! use serde_json::json;
//! use sqlit::{ColumnInfo, Database, Schema, TableInfo};
//!
//! let schema = Schema::builder()
//!     .table(TableInfo::new("user")
//!         .column(ColumnInfo::new("id", "INTEGER").primary_key().auto_increment())
//!         .column(ColumnInfo::new("email", "VARCHAR(255)").unique()))
//!     .table(TableInfo::new("order")
//!         .column(ColumnInfo::new("id", "INTEGER").primary_key().auto_increment())
//!         .column(ColumnInfo::new("code", "VARCHAR(32)").unique())
//!         .column(ColumnInfo::new("user_id", "INTEGER").references("user", "id")))
//!     .build()?;
//!
//! let mut db = Database::connect("sqlite::memory:", schema).await?;
//! db.create_tables().await?;
//!
//! db.append("Order", json!({ "code": "A-1", "user": { "email": "a@b.c" } }))?;
//! db.flush().await?;
//!
//! let orders = db.table("Order")?.select(&json!("*"), &Default::default()).await?;
//! ```

pub mod connection;
pub mod copy;
pub mod database;
pub mod document;
pub mod error;
pub mod flush;
pub mod mutation;
pub mod query;
pub mod record;
pub mod replace;
pub mod schema;
pub mod select;
pub mod serializer;
pub mod table;
pub mod transaction;
pub mod value;

pub use connection::{Connection, ConnectionPool, Row, SqlxConnection, SqlxPool};
pub use copy::CopyOptions;
pub use database::{Database, DatabaseBuilder, Drivers, RetryPolicy};
pub use error::{Error, Result};
pub use flush::{FlushHook, FlushOptions};
pub use query::encode_filter;
pub use record::{Data, FlushMethod, FlushState, Input, Record, RecordId};
pub use schema::{ColumnInfo, Field, Model, ModelId, Schema, TableInfo};
pub use select::{FieldOptions, TreeResult};
pub use serializer::{JsonSerializer, XstreamSerializer};
pub use table::{SelectOptions, Table};
pub use transaction::Transaction;
pub use value::{Document, Value};
