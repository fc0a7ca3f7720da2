pub mod command;
pub mod fastx;
pub mod file;
pub mod merge;
pub mod repeats;
pub mod sambam;
pub mod scheduler;
pub mod sequence;
pub mod streams;
pub mod system;
