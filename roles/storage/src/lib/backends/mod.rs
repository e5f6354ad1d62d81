pub mod memory;

#[cfg(feature = "sqlite-backend")]
pub mod sqlite;
