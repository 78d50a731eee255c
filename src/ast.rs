//! Compiled program representation consumed by the engine.
//!
//! These values are produced by the compiler front end, already validated
//! for shape. Everything that depends on runtime data (types of evaluated
//! values, guard outcomes, record contents) is checked by the engine.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};

use crate::eval::value::Value;

/// Source position of a statement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub line: usize,
    pub column: usize,
}

/// Declarations shared read-only across every run of a program.
#[derive(Debug, Clone, Default)]
pub struct Program {
    pub records: BTreeMap<String, RecordSchema>,
    pub ais: BTreeMap<String, AiDecl>,
    pub agents: BTreeMap<String, AgentDecl>,
    pub functions: BTreeMap<String, FunctionDecl>,
    pub jobs: BTreeMap<String, JobDecl>,
}

impl Program {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_record(mut self, schema: RecordSchema) -> Self {
        self.records.insert(schema.name.clone(), schema);
        self
    }

    pub fn with_ai(mut self, ai: AiDecl) -> Self {
        self.ais.insert(ai.name.clone(), ai);
        self
    }

    pub fn with_agent(mut self, agent: AgentDecl) -> Self {
        self.agents.insert(agent.name.clone(), agent);
        self
    }

    pub fn with_function(mut self, function: FunctionDecl) -> Self {
        self.functions.insert(function.name.clone(), function);
        self
    }

    pub fn with_job(mut self, job: JobDecl) -> Self {
        self.jobs.insert(job.name.clone(), job);
        self
    }
}

#[derive(Debug, Clone)]
pub struct Flow {
    pub name: String,
    pub kind: FlowKind,
    pub requires: Option<Expression>,
    pub audited: bool,
    pub capabilities: BTreeSet<String>,
    pub span: Span,
}

impl Flow {
    pub fn new(name: impl Into<String>, body: Vec<Statement>) -> Self {
        Self {
            name: name.into(),
            kind: FlowKind::Statements(body),
            requires: None,
            audited: false,
            capabilities: BTreeSet::new(),
            span: Span::default(),
        }
    }

    pub fn with_kind(mut self, kind: FlowKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn requires(mut self, expr: Expression) -> Self {
        self.requires = Some(expr);
        self
    }

    pub fn audited(mut self) -> Self {
        self.audited = true;
        self
    }

    pub fn capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }

    /// True when any statement or step of the flow writes records.
    pub fn mutates(&self) -> bool {
        match &self.kind {
            FlowKind::Statements(body) => statements_mutate(body),
            FlowKind::Declarative(steps) => steps.iter().any(|step| {
                matches!(
                    step,
                    FlowStep::Create { .. } | FlowStep::Update { .. } | FlowStep::Delete { .. }
                )
            }),
            FlowKind::AiPattern(_) | FlowKind::Sandboxed => false,
        }
    }
}

fn statements_mutate(body: &[Statement]) -> bool {
    body.iter().any(|stmt| match &stmt.kind {
        StatementKind::Save { .. }
        | StatementKind::Create { .. }
        | StatementKind::Update { .. }
        | StatementKind::Delete { .. } => true,
        StatementKind::If {
            then_body,
            else_body,
            ..
        } => statements_mutate(then_body) || statements_mutate(else_body),
        StatementKind::Match {
            cases, otherwise, ..
        } => {
            cases.iter().any(|case| statements_mutate(&case.body))
                || otherwise.as_deref().is_some_and(statements_mutate)
        }
        StatementKind::TryCatch {
            try_body,
            catch_body,
            ..
        } => statements_mutate(try_body) || statements_mutate(catch_body),
        StatementKind::Repeat { body, .. }
        | StatementKind::RepeatWhile { body, .. }
        | StatementKind::ForEach { body, .. } => statements_mutate(body),
        _ => false,
    })
}

/// Which runner executes the flow body.
#[derive(Debug, Clone)]
pub enum FlowKind {
    Statements(Vec<Statement>),
    Declarative(Vec<FlowStep>),
    AiPattern(AiPatternSpec),
    Sandboxed,
}

#[derive(Debug, Clone)]
pub enum FlowStep {
    Input {
        fields: Vec<FieldSpec>,
    },
    Require {
        condition: Expression,
    },
    Create {
        record: String,
        fields: Vec<(String, Expression)>,
    },
    Update {
        record: String,
        predicate: Expression,
        updates: Vec<(String, Expression)>,
    },
    Delete {
        record: String,
        predicate: Expression,
    },
}

impl FlowStep {
    pub fn kind_name(&self) -> &'static str {
        match self {
            FlowStep::Input { .. } => "input",
            FlowStep::Require { .. } => "require",
            FlowStep::Create { .. } => "create",
            FlowStep::Update { .. } => "update",
            FlowStep::Delete { .. } => "delete",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    LlmCall,
    Translate,
    Qa,
    Cot,
}

#[derive(Debug, Clone)]
pub struct AiPatternSpec {
    pub kind: PatternKind,
    pub model: String,
    pub prompt: Option<String>,
    pub source_language: Option<String>,
    pub target_language: Option<String>,
    pub output_type: TypeName,
    pub output_fields: Vec<FieldSpec>,
}

/// Static type annotations carried by contracts, schemas and signatures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeName {
    Any,
    Text,
    Number,
    Boolean,
    Json,
    List(Box<TypeName>),
}

impl TypeName {
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (TypeName::Any, _) => true,
            (TypeName::Text, Value::Text(_)) => true,
            (TypeName::Number, Value::Number(_)) => true,
            (TypeName::Boolean, Value::Boolean(_)) => true,
            (TypeName::Json, Value::Map(_)) => true,
            (TypeName::List(inner), Value::List(items)) => items.iter().all(|i| inner.accepts(i)),
            _ => false,
        }
    }

    pub fn name(&self) -> String {
        match self {
            TypeName::Any => "any".to_string(),
            TypeName::Text => "text".to_string(),
            TypeName::Number => "number".to_string(),
            TypeName::Boolean => "boolean".to_string(),
            TypeName::Json => "json".to_string(),
            TypeName::List(inner) => format!("list<{}>", inner.name()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub name: String,
    pub type_name: TypeName,
    pub required: bool,
}

impl FieldSpec {
    pub fn required(name: impl Into<String>, type_name: TypeName) -> Self {
        Self {
            name: name.into(),
            type_name,
            required: true,
        }
    }

    pub fn optional(name: impl Into<String>, type_name: TypeName) -> Self {
        Self {
            name: name.into(),
            type_name,
            required: false,
        }
    }
}

/// Record type definition. `tenant_key` names the identity field that scopes rows.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordSchema {
    pub name: String,
    pub fields: Vec<FieldSpec>,
    pub tenant_key: Option<String>,
}

impl RecordSchema {
    pub fn new(name: impl Into<String>, fields: Vec<FieldSpec>) -> Self {
        Self {
            name: name.into(),
            fields,
            tenant_key: None,
        }
    }

    pub fn tenant_scoped(mut self, key: impl Into<String>) -> Self {
        self.tenant_key = Some(key.into());
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Snake-case name used for state keys and result locals.
    pub fn local_name(&self) -> String {
        self.name.to_lowercase()
    }
}

#[derive(Debug, Clone)]
pub struct AiDecl {
    pub name: String,
    pub model: String,
    pub system_prompt: String,
    pub exposed_tools: Vec<String>,
    pub memory: bool,
}

#[derive(Debug, Clone)]
pub struct AgentDecl {
    pub name: String,
    pub ai: String,
    pub system_prompt: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FunctionDecl {
    pub name: String,
    pub params: Vec<FieldSpec>,
    pub returns: TypeName,
    pub body: Vec<Statement>,
}

#[derive(Debug, Clone)]
pub struct JobDecl {
    pub name: String,
    pub body: Vec<Statement>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    Literal(Value),
    Variable(String),
    Attribute {
        base: String,
        path: Vec<String>,
    },
    StatePath(Vec<String>),
    Unary {
        op: UnaryOperator,
        operand: Box<Expression>,
    },
    Binary {
        op: BinaryOperator,
        left: Box<Expression>,
        right: Box<Expression>,
    },
    Comparison {
        op: ComparisonOperator,
        left: Box<Expression>,
        right: Box<Expression>,
    },
    List(Vec<Expression>),
    Map(Vec<(String, Expression)>),
    ListOp {
        op: ListOperation,
        target: Box<Expression>,
        argument: Option<Box<Expression>>,
    },
    MapOp {
        op: MapOperation,
        target: Box<Expression>,
        key: Option<Box<Expression>>,
        value: Option<Box<Expression>>,
    },
    ListMap {
        target: Box<Expression>,
        binder: String,
        body: Box<Expression>,
    },
    ListFilter {
        target: Box<Expression>,
        binder: String,
        predicate: Box<Expression>,
    },
    ListReduce {
        target: Box<Expression>,
        accumulator: String,
        binder: String,
        start: Box<Expression>,
        body: Box<Expression>,
    },
    ToolCall {
        name: String,
        arguments: Vec<Argument>,
        returns: Option<TypeName>,
    },
    FunctionCall {
        name: String,
        arguments: Vec<Argument>,
    },
    PipelineCall {
        pipeline: String,
        arguments: Vec<Argument>,
        outputs: Vec<String>,
    },
}

impl Expression {
    pub fn literal(value: impl Into<Value>) -> Self {
        Expression::Literal(value.into())
    }

    pub fn var(name: impl Into<String>) -> Self {
        Expression::Variable(name.into())
    }

    pub fn attr(base: impl Into<String>, path: &[&str]) -> Self {
        Expression::Attribute {
            base: base.into(),
            path: path.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn state(path: &[&str]) -> Self {
        Expression::StatePath(path.iter().map(|s| s.to_string()).collect())
    }

    pub fn not(operand: Expression) -> Self {
        Expression::Unary {
            op: UnaryOperator::Not,
            operand: Box::new(operand),
        }
    }

    pub fn binary(op: BinaryOperator, left: Expression, right: Expression) -> Self {
        Expression::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn compare(op: ComparisonOperator, left: Expression, right: Expression) -> Self {
        Expression::Comparison {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    /// True when the expression reads the `mutation` binding.
    pub fn mentions_mutation(&self) -> bool {
        self.mentions_variable("mutation")
    }

    /// True when the expression reads the `identity` binding.
    pub fn mentions_identity(&self) -> bool {
        self.mentions_variable("identity")
    }

    fn mentions_variable(&self, name: &str) -> bool {
        match self {
            Expression::Variable(var) => var == name,
            Expression::Attribute { base, .. } => base == name,
            Expression::Literal(_) | Expression::StatePath(_) => false,
            Expression::Unary { operand, .. } => operand.mentions_variable(name),
            Expression::Binary { left, right, .. } | Expression::Comparison { left, right, .. } => {
                left.mentions_variable(name) || right.mentions_variable(name)
            }
            Expression::List(items) => items.iter().any(|i| i.mentions_variable(name)),
            Expression::Map(entries) => entries.iter().any(|(_, v)| v.mentions_variable(name)),
            Expression::ListOp {
                target, argument, ..
            } => {
                target.mentions_variable(name)
                    || argument.as_ref().is_some_and(|a| a.mentions_variable(name))
            }
            Expression::MapOp {
                target, key, value, ..
            } => {
                target.mentions_variable(name)
                    || key.as_ref().is_some_and(|k| k.mentions_variable(name))
                    || value.as_ref().is_some_and(|v| v.mentions_variable(name))
            }
            Expression::ListMap { target, body, .. } => {
                target.mentions_variable(name) || body.mentions_variable(name)
            }
            Expression::ListFilter {
                target, predicate, ..
            } => target.mentions_variable(name) || predicate.mentions_variable(name),
            Expression::ListReduce {
                target,
                start,
                body,
                ..
            } => {
                target.mentions_variable(name)
                    || start.mentions_variable(name)
                    || body.mentions_variable(name)
            }
            Expression::ToolCall { arguments, .. }
            | Expression::FunctionCall { arguments, .. }
            | Expression::PipelineCall { arguments, .. } => {
                arguments.iter().any(|a| a.value.mentions_variable(name))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Argument {
    pub name: String,
    pub value: Expression,
}

impl Argument {
    pub fn new(name: impl Into<String>, value: Expression) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOperator {
    Not,
    Plus,
    Minus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOperator {
    And,
    Or,
    Add,
    Subtract,
    Multiply,
    Divide,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ComparisonOperator {
    Eq,
    Ne,
    Gt,
    Lt,
    Gte,
    Lte,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListOperation {
    Length,
    Get,
    Append,
    Contains,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapOperation {
    Get,
    Set,
    Keys,
    Has,
}

#[derive(Debug, Clone)]
pub struct Statement {
    pub kind: StatementKind,
    pub span: Span,
}

impl Statement {
    pub fn new(kind: StatementKind) -> Self {
        Self {
            kind,
            span: Span::default(),
        }
    }

    pub fn at(mut self, line: usize, column: usize) -> Self {
        self.span = Span { line, column };
        self
    }

    pub fn kind_name(&self) -> &'static str {
        (&self.kind).into()
    }
}

impl From<StatementKind> for Statement {
    fn from(kind: StatementKind) -> Self {
        Statement::new(kind)
    }
}

/// Assignment destination of `Set`.
#[derive(Debug, Clone, PartialEq)]
pub enum AssignTarget {
    Local(String),
    State(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct MatchCase {
    pub pattern: Expression,
    pub body: Vec<Statement>,
}

#[derive(Debug, Clone)]
pub struct AgentEntry {
    pub agent: String,
    pub input: Expression,
}

#[derive(Debug, Clone)]
pub struct Branch<T> {
    pub name: String,
    pub body: T,
}

impl<T> Branch<T> {
    pub fn new(name: impl Into<String>, body: T) -> Self {
        Self {
            name: name.into(),
            body,
        }
    }
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    #[default]
    AllRequired,
    FirstSuccess,
    BestEffort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MetricOperation {
    Increment,
    Add,
    Set,
    Record,
}

/// Statement variants. The variant name in snake case is the statement kind
/// reported in error locations.
#[derive(Debug, Clone, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum StatementKind {
    Let {
        name: String,
        value: Expression,
        constant: bool,
    },
    Set {
        target: AssignTarget,
        value: Expression,
    },
    If {
        condition: Expression,
        then_body: Vec<Statement>,
        else_body: Vec<Statement>,
    },
    Match {
        subject: Expression,
        cases: Vec<MatchCase>,
        otherwise: Option<Vec<Statement>>,
    },
    TryCatch {
        try_body: Vec<Statement>,
        catch_var: String,
        catch_body: Vec<Statement>,
    },
    Repeat {
        count: Expression,
        body: Vec<Statement>,
    },
    RepeatWhile {
        condition: Expression,
        body: Vec<Statement>,
    },
    ForEach {
        binder: String,
        iterable: Expression,
        body: Vec<Statement>,
    },
    Return(Expression),
    Save {
        record: String,
    },
    Create {
        record: String,
        values: Expression,
        target: String,
    },
    Find {
        record: String,
        predicate: Expression,
    },
    Update {
        record: String,
        predicate: Expression,
        updates: Vec<(String, Expression)>,
    },
    Delete {
        record: String,
        predicate: Expression,
    },
    AskAi {
        ai: String,
        input: Expression,
        target: String,
    },
    RunAgent {
        agent: String,
        input: Expression,
        target: String,
    },
    RunAgentsParallel {
        entries: Vec<AgentEntry>,
        target: String,
        merge: MergePolicy,
    },
    Parallel {
        branches: Vec<Branch<Vec<Statement>>>,
        merge: MergePolicy,
        target: Option<String>,
    },
    Orchestration {
        branches: Vec<Branch<Expression>>,
        merge: MergePolicy,
        target: String,
    },
    EnqueueJob {
        job: String,
        input: Option<Expression>,
        after: Option<Expression>,
    },
    AdvanceTime {
        amount: Expression,
    },
    Log {
        level: LogLevel,
        message: Expression,
        fields: Option<Expression>,
    },
    Metric {
        op: MetricOperation,
        name: String,
        value: Option<Expression>,
    },
    Await {
        target: String,
        value: Expression,
    },
    Yield(Expression),
    ThemeChange(Expression),
    /// A construct the front end emitted that this engine does not execute.
    Unsupported(String),
}
