mod memory;
mod postgres;

pub use memory::MemoryStorage;
pub use postgres::PgStorage;
