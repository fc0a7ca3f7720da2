pub mod decontaminate;
