pub mod crc32;
pub mod file;
pub mod math;
pub mod read;
