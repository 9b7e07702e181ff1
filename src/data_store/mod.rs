pub mod kv_store;
pub mod versioned_value;
