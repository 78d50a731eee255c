pub mod agents;
pub mod context;
pub mod declarative;
pub mod evaluator;
pub mod expression;
pub mod parallel;
pub mod patterns;
pub mod records;
pub mod statement;
pub mod value;
