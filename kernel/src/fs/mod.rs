pub mod file;

pub use self::file::{File, FileHandle, MemFile};
