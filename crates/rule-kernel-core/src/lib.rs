use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum CompileError {
    #[error("rule name must not be empty")]
    EmptyRuleName,
    #[error("rule '{rule}' binds variable '{var}' more than once")]
    DuplicateVariable { rule: String, var: String },
    #[error("rule '{rule}' references unknown variable '{var}'")]
    UnknownVariable { rule: String, var: String },
}

/// A literal JSON value usable inside rule tests.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Literal {
    Str(String),
    Num(f64),
    Bool(bool),
    Array(Vec<Literal>),
    Object(Vec<(String, Literal)>),
}

impl Literal {
    #[must_use]
    pub fn to_json(&self) -> Value {
        match self {
            Self::Str(s) => Value::from(s.clone()),
            Self::Num(n) => number_to_json(*n),
            Self::Bool(b) => Value::from(*b),
            Self::Array(items) => Value::Array(items.iter().map(Literal::to_json).collect()),
            Self::Object(attrs) => {
                let mut map = serde_json::Map::new();
                for (key, value) in attrs {
                    map.insert(key.clone(), value.to_json());
                }
                Value::Object(map)
            }
        }
    }
}

/// A literal JSON array; iterable and convertible into [`Literal`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArrayLit(pub Vec<Literal>);

/// A literal JSON object with explicit attribute order; renders with sorted keys.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ObjectLit(pub Vec<(String, Literal)>);

impl From<ArrayLit> for Literal {
    fn from(value: ArrayLit) -> Self {
        Self::Array(value.0)
    }
}

impl From<ObjectLit> for Literal {
    fn from(value: ObjectLit) -> Self {
        Self::Object(value.0)
    }
}

/// A dotted path into the match-local resource's `data` document.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct FieldRef {
    pub path: Vec<String>,
}

/// A dotted path into a named sibling match's `data` document.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct JoinFieldRef {
    pub var: String,
    pub path: Vec<String>,
}

/// Operand admissible in ordered (`<`, `<=`, `>`, `>=`) comparisons.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum NumericOperand {
    Num(f64),
    Field(FieldRef),
    JoinField(JoinFieldRef),
}

/// Operand admissible in equality (`=`, `<>`) comparisons.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ComparableOperand {
    Num(f64),
    Str(String),
    Bool(bool),
    Field(FieldRef),
    JoinField(JoinFieldRef),
}

impl From<f64> for NumericOperand {
    fn from(value: f64) -> Self {
        Self::Num(value)
    }
}

impl From<FieldRef> for NumericOperand {
    fn from(value: FieldRef) -> Self {
        Self::Field(value)
    }
}

impl From<JoinFieldRef> for NumericOperand {
    fn from(value: JoinFieldRef) -> Self {
        Self::JoinField(value)
    }
}

impl From<f64> for ComparableOperand {
    fn from(value: f64) -> Self {
        Self::Num(value)
    }
}

impl From<&str> for ComparableOperand {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for ComparableOperand {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<bool> for ComparableOperand {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<FieldRef> for ComparableOperand {
    fn from(value: FieldRef) -> Self {
        Self::Field(value)
    }
}

impl From<JoinFieldRef> for ComparableOperand {
    fn from(value: JoinFieldRef) -> Self {
        Self::JoinField(value)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum NumericOp {
    Lt,
    Le,
    Gt,
    Ge,
}

impl NumericOp {
    #[must_use]
    pub fn as_sql(self) -> &'static str {
        match self {
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ComparableOp {
    Eq,
    Neq,
}

impl ComparableOp {
    #[must_use]
    pub fn as_sql(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Neq => "<>",
        }
    }
}

/// Which projection an iterable view produces per element.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum IterProjection {
    Values,
    Keys,
    Entries,
}

/// The collection an iterable view ranges over.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum IterSource {
    Array(Vec<Literal>),
    Object(Vec<(String, Literal)>),
    Field(FieldRef),
    JoinField(JoinFieldRef),
}

impl From<ArrayLit> for IterSource {
    fn from(value: ArrayLit) -> Self {
        Self::Array(value.0)
    }
}

impl From<ObjectLit> for IterSource {
    fn from(value: ObjectLit) -> Self {
        Self::Object(value.0)
    }
}

impl From<FieldRef> for IterSource {
    fn from(value: FieldRef) -> Self {
        Self::Field(value)
    }
}

impl From<JoinFieldRef> for IterSource {
    fn from(value: JoinFieldRef) -> Self {
        Self::JoinField(value)
    }
}

/// An iterable view over an array, object, or document field, compiled to a
/// correlated sub-select.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Iterable {
    pub source: IterSource,
    pub projection: IterProjection,
}

/// One test inside a match clause.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Test {
    Numeric {
        op: NumericOp,
        lhs: NumericOperand,
        rhs: NumericOperand,
    },
    Comparable {
        op: ComparableOp,
        lhs: ComparableOperand,
        rhs: ComparableOperand,
    },
    And(Box<Test>, Box<Test>),
    Or(Box<Test>, Box<Test>),
    Not(Box<Test>),
    Namespace(String),
    Within {
        needle: ComparableOperand,
        haystack: Iterable,
    },
}

/// One clause of a rule LHS: binds a resource of `kind` to `var` under the
/// conjunction of `tests`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Match {
    pub kind: String,
    pub var: String,
    pub tests: Vec<Test>,
}

impl Match {
    #[must_use]
    pub fn new(kind: impl Into<String>, var: impl Into<String>) -> Self {
        Self { kind: kind.into(), var: var.into(), tests: Vec::new() }
    }

    #[must_use]
    pub fn test(mut self, test: Test) -> Self {
        self.tests.push(test);
        self
    }

    #[must_use]
    pub fn tests(mut self, tests: impl IntoIterator<Item = Test>) -> Self {
        self.tests.extend(tests);
        self
    }
}

pub fn array(items: impl IntoIterator<Item = Literal>) -> ArrayLit {
    ArrayLit(items.into_iter().collect())
}

pub fn object(attrs: impl IntoIterator<Item = (String, Literal)>) -> ObjectLit {
    ObjectLit(attrs.into_iter().collect())
}

pub fn attribute(key: impl Into<String>, value: impl Into<Literal>) -> (String, Literal) {
    (key.into(), value.into())
}

impl From<f64> for Literal {
    fn from(value: f64) -> Self {
        Self::Num(value)
    }
}

impl From<&str> for Literal {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for Literal {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<bool> for Literal {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

pub fn field<S: Into<String>>(path: impl IntoIterator<Item = S>) -> FieldRef {
    FieldRef { path: path.into_iter().map(Into::into).collect() }
}

pub fn join_field<S: Into<String>>(
    var: impl Into<String>,
    path: impl IntoIterator<Item = S>,
) -> JoinFieldRef {
    JoinFieldRef { var: var.into(), path: path.into_iter().map(Into::into).collect() }
}

pub fn namespace(name: impl Into<String>) -> Test {
    Test::Namespace(name.into())
}

pub fn lt(lhs: impl Into<NumericOperand>, rhs: impl Into<NumericOperand>) -> Test {
    Test::Numeric { op: NumericOp::Lt, lhs: lhs.into(), rhs: rhs.into() }
}

pub fn le(lhs: impl Into<NumericOperand>, rhs: impl Into<NumericOperand>) -> Test {
    Test::Numeric { op: NumericOp::Le, lhs: lhs.into(), rhs: rhs.into() }
}

pub fn gt(lhs: impl Into<NumericOperand>, rhs: impl Into<NumericOperand>) -> Test {
    Test::Numeric { op: NumericOp::Gt, lhs: lhs.into(), rhs: rhs.into() }
}

pub fn ge(lhs: impl Into<NumericOperand>, rhs: impl Into<NumericOperand>) -> Test {
    Test::Numeric { op: NumericOp::Ge, lhs: lhs.into(), rhs: rhs.into() }
}

pub fn eq(lhs: impl Into<ComparableOperand>, rhs: impl Into<ComparableOperand>) -> Test {
    Test::Comparable { op: ComparableOp::Eq, lhs: lhs.into(), rhs: rhs.into() }
}

pub fn neq(lhs: impl Into<ComparableOperand>, rhs: impl Into<ComparableOperand>) -> Test {
    Test::Comparable { op: ComparableOp::Neq, lhs: lhs.into(), rhs: rhs.into() }
}

pub fn and(lhs: Test, rhs: Test) -> Test {
    Test::And(Box::new(lhs), Box::new(rhs))
}

pub fn or(lhs: Test, rhs: Test) -> Test {
    Test::Or(Box::new(lhs), Box::new(rhs))
}

pub fn not(test: Test) -> Test {
    Test::Not(Box::new(test))
}

pub fn values(source: impl Into<IterSource>) -> Iterable {
    Iterable { source: source.into(), projection: IterProjection::Values }
}

pub fn keys(source: impl Into<IterSource>) -> Iterable {
    Iterable { source: source.into(), projection: IterProjection::Keys }
}

pub fn entries(source: impl Into<IterSource>) -> Iterable {
    Iterable { source: source.into(), projection: IterProjection::Entries }
}

pub fn within(needle: impl Into<ComparableOperand>, haystack: Iterable) -> Test {
    Test::Within { needle: needle.into(), haystack }
}

/// A compiled trigger: its deterministic name plus the full DDL statement.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Trigger {
    pub name: String,
    pub sql: String,
}

/// The relational lowering of one rule LHS.
///
/// `insert_predicate` materialises every instantiation tuple currently
/// satisfying the LHS; the triggers re-run it, restricted to the written row,
/// whenever a resource of a referenced kind is inserted or updated.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CompiledRule {
    pub rule_index: usize,
    pub insert_predicate: Option<String>,
    pub triggers: Vec<Trigger>,
    pub object_map: HashMap<String, usize>,
    /// Variables named by `join_field` references anywhere in the LHS.
    pub referenced_vars: BTreeSet<String>,
}

/// Lower a rule LHS into its instantiation predicate and per-variable triggers.
///
/// Compilation is pure: the same inputs produce byte-identical SQL and trigger
/// names on every run.
///
/// # Errors
/// Returns [`CompileError`] for an empty rule name, a variable bound twice, or
/// a join reference to an undeclared variable.
pub fn compile_rule(
    rule_index: usize,
    priority: i64,
    name: &str,
    matches: &[Match],
) -> Result<CompiledRule, CompileError> {
    if name.trim().is_empty() {
        return Err(CompileError::EmptyRuleName);
    }

    let mut object_map = HashMap::new();
    for (position, m) in matches.iter().enumerate() {
        if object_map.insert(m.var.clone(), position).is_some() {
            return Err(CompileError::DuplicateVariable {
                rule: name.to_string(),
                var: m.var.clone(),
            });
        }
    }

    if matches.is_empty() {
        return Ok(CompiledRule {
            rule_index,
            insert_predicate: None,
            triggers: Vec::new(),
            object_map,
            referenced_vars: BTreeSet::new(),
        });
    }

    let mut compiler = Compiler::new(name, matches);
    let condition = compiler.conditions()?;
    let predicate = select_predicate(rule_index, priority, matches, condition.as_deref());

    let mut triggers = Vec::with_capacity(matches.len() * 2);
    for m in matches {
        let insert_name = format!("{}_resources_{}", m.var, rule_index);
        triggers.push(Trigger {
            sql: format!(
                "CREATE TRIGGER {insert_name} AFTER INSERT ON resources WHEN NEW.kind = '{}' \
                 BEGIN {predicate} AND {}.id = NEW.id; END",
                sql_str(&m.kind),
                m.var,
            ),
            name: insert_name,
        });

        let update_name = format!("{}_resources_update_{}", m.var, rule_index);
        triggers.push(Trigger {
            sql: format!(
                "CREATE TRIGGER {update_name} AFTER UPDATE ON resources WHEN NEW.kind = '{}' \
                 BEGIN {predicate} AND {}.id = NEW.id; END",
                sql_str(&m.kind),
                m.var,
            ),
            name: update_name,
        });
    }

    Ok(CompiledRule {
        rule_index,
        insert_predicate: Some(predicate),
        triggers,
        object_map,
        referenced_vars: compiler.refs,
    })
}

fn select_predicate(
    rule_index: usize,
    priority: i64,
    matches: &[Match],
    condition: Option<&str>,
) -> String {
    let ids =
        matches.iter().map(|m| format!("{}.id", m.var)).collect::<Vec<_>>().join(", ");
    let tables = matches
        .iter()
        .map(|m| format!("resources {}", m.var))
        .collect::<Vec<_>>()
        .join(", ");
    let kinds = matches
        .iter()
        .map(|m| format!("{}.kind = '{}'", m.var, sql_str(&m.kind)))
        .collect::<Vec<_>>()
        .join(" AND ");

    let mut sql = format!(
        "INSERT INTO instantiations (rule_num, priority, resources) \
         SELECT {rule_index}, {priority}, json_array({ids}) FROM {tables} WHERE {kinds}"
    );
    if let Some(condition) = condition {
        sql.push_str(" AND ");
        sql.push_str(condition);
    }

    sql
}

struct Compiler<'a> {
    rule: &'a str,
    matches: &'a [Match],
    current: usize,
    refs: BTreeSet<String>,
    gensym: u32,
}

impl<'a> Compiler<'a> {
    fn new(rule: &'a str, matches: &'a [Match]) -> Self {
        Self { rule, matches, current: 0, refs: BTreeSet::new(), gensym: 0 }
    }

    fn var(&self) -> &str {
        &self.matches[self.current].var
    }

    fn fresh(&mut self, base: &str) -> String {
        let n = self.gensym;
        self.gensym += 1;
        format!("{base}{n}")
    }

    fn resolve_join(&mut self, var: &str) -> Result<(), CompileError> {
        if self.matches.iter().any(|m| m.var == var) {
            self.refs.insert(var.to_string());
            Ok(())
        } else {
            Err(CompileError::UnknownVariable {
                rule: self.rule.to_string(),
                var: var.to_string(),
            })
        }
    }

    /// The conjunction over all matches; `None` when every match is test-free.
    fn conditions(&mut self) -> Result<Option<String>, CompileError> {
        let mut exprs = Vec::new();
        for index in 0..self.matches.len() {
            self.current = index;
            if let Some(expr) = self.match_expr()? {
                exprs.push(expr);
            }
        }

        Ok(exprs.into_iter().reduce(|acc, next| format!("({acc}) AND ({next})")))
    }

    /// The current match's tests folded left: `((t1) AND t2) AND t3`.
    fn match_expr(&mut self) -> Result<Option<String>, CompileError> {
        let tests = &self.matches[self.current].tests;
        let mut expr: Option<String> = None;
        for test in tests {
            let rendered = self.test(test)?;
            expr = Some(match expr {
                None => rendered,
                Some(acc) => format!("({acc}) AND {rendered}"),
            });
        }

        Ok(expr)
    }

    fn test(&mut self, test: &Test) -> Result<String, CompileError> {
        match test {
            Test::Numeric { op, lhs, rhs } => {
                let lhs = self.numeric(lhs)?;
                let rhs = self.numeric(rhs)?;
                Ok(format!("{lhs} {} {rhs}", op.as_sql()))
            }
            Test::Comparable { op, lhs, rhs } => {
                let lhs = self.comparable(lhs)?;
                let rhs = self.comparable(rhs)?;
                Ok(format!("{lhs} {} {rhs}", op.as_sql()))
            }
            Test::And(lhs, rhs) => {
                let lhs = self.test(lhs)?;
                let rhs = self.test(rhs)?;
                Ok(format!("({lhs}) AND ({rhs})"))
            }
            Test::Or(lhs, rhs) => {
                let lhs = self.test(lhs)?;
                let rhs = self.test(rhs)?;
                Ok(format!("({lhs}) OR ({rhs})"))
            }
            Test::Not(inner) => {
                let inner = self.test(inner)?;
                Ok(format!("NOT({inner})"))
            }
            Test::Namespace(name) => Ok(format!("{}.namespace = '{}'", self.var(), sql_str(name))),
            Test::Within { needle, haystack } => {
                let needle = self.comparable(needle)?;
                let haystack = self.iterable(haystack)?;
                Ok(format!("{needle} IN ({haystack})"))
            }
        }
    }

    fn numeric(&mut self, operand: &NumericOperand) -> Result<String, CompileError> {
        match operand {
            NumericOperand::Num(n) => Ok(format_number(*n)),
            NumericOperand::Field(field) => Ok(self.extract(self.var(), &field.path)),
            NumericOperand::JoinField(join) => {
                self.resolve_join(&join.var)?;
                Ok(self.extract(&join.var, &join.path))
            }
        }
    }

    fn comparable(&mut self, operand: &ComparableOperand) -> Result<String, CompileError> {
        match operand {
            ComparableOperand::Num(n) => Ok(format_number(*n)),
            ComparableOperand::Str(s) => Ok(format!("'{}'", sql_str(s))),
            ComparableOperand::Bool(b) => Ok(b.to_string()),
            ComparableOperand::Field(field) => Ok(self.extract(self.var(), &field.path)),
            ComparableOperand::JoinField(join) => {
                self.resolve_join(&join.var)?;
                Ok(self.extract(&join.var, &join.path))
            }
        }
    }

    fn iterable(&mut self, iterable: &Iterable) -> Result<String, CompileError> {
        match &iterable.source {
            IterSource::Array(items) => {
                let json = Literal::Array(items.clone()).to_json().to_string();
                Ok(literal_each(iterable.projection, &json))
            }
            IterSource::Object(attrs) => {
                let json = Literal::Object(attrs.clone()).to_json().to_string();
                Ok(literal_each(iterable.projection, &json))
            }
            IterSource::Field(field) => {
                let var = self.var().to_string();
                Ok(self.correlated_each(iterable.projection, &var, &field.path))
            }
            IterSource::JoinField(join) => {
                self.resolve_join(&join.var)?;
                let var = join.var.clone();
                Ok(self.correlated_each(iterable.projection, &var, &join.path))
            }
        }
    }

    fn correlated_each(&mut self, projection: IterProjection, var: &str, path: &[String]) -> String {
        let base = self.fresh(var);
        let each = self.fresh("each");
        let projection = match projection {
            IterProjection::Values => format!("{each}.value"),
            IterProjection::Keys => format!("{each}.key"),
            IterProjection::Entries => format!("json_object({each}.key, {each}.value)"),
        };

        format!(
            "SELECT {projection} FROM resources {base}, json_each({base}.data, '{}') {each} \
             WHERE {base}.id = {var}.id",
            json_path(path),
        )
    }

    fn extract(&self, var: &str, path: &[String]) -> String {
        format!("json_extract({var}.data, '{}')", json_path(path))
    }
}

fn literal_each(projection: IterProjection, json: &str) -> String {
    let projection = match projection {
        IterProjection::Values => "value",
        IterProjection::Keys => "key",
        IterProjection::Entries => "json_object(key, value)",
    };

    format!("SELECT {projection} FROM json_each('{}')", sql_str(json))
}

/// Dotted JSON path rendered in SQLite's `$.a.b` syntax.
pub fn json_path<S: AsRef<str>>(path: &[S]) -> String {
    let segments = path.iter().map(AsRef::as_ref).collect::<Vec<_>>();
    format!("$.{}", segments.join("."))
}

/// Escape a string for embedding in a single-quoted SQL literal.
fn sql_str(s: &str) -> String {
    s.replace('\'', "''")
}

/// Render a number the shortest way: integral doubles drop the fraction.
fn format_number(n: f64) -> String {
    if n == n.trunc() && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

fn number_to_json(n: f64) -> Value {
    if n == n.trunc() && n.abs() < 1e15 {
        Value::from(n as i64)
    } else {
        Value::from(n)
    }
}
