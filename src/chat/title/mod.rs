//! Title generation collaborator.

pub mod title_generator;

pub use title_generator::{
    OllamaTitleGenerator, TitleCleaner, TitleFuture, TitleGenerator, build_title_prompt,
};
