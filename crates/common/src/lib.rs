// atelier-common: shared protocol and domain types for the Atelier workspace

pub mod protocol;
pub mod types;
