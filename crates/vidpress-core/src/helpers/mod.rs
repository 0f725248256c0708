// crates/vidpress-core/src/helpers/mod.rs
//
// Pure helpers shared by vidpress-media and any caller that wants to preview
// the output geometry or format status text without opening a file.

pub mod geometry;
pub mod time;
