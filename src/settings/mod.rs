// Settings — the on-disk settings file and its environment overrides.

pub mod store;
pub mod types;
