//! Plan definitions: parsing, placeholders, guard expressions, dependency
//! graph, and pre-execution validation.

pub mod dag;
pub mod definition;
pub mod expression;
pub mod placeholder;
