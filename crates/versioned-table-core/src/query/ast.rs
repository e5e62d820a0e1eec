//! Typed AST of the query dialect.
//!
//! The dialect is a SELECT-only subset of SQL. Queries arrive already
//! parsed into [`QuerySpec`]; the translator rewrites the tree in place
//! (table and column names to physical names, literals to bind parameters)
//! and renders it with [`std::fmt::Display`].
//!
//! Rendering follows operator precedence: a child binary expression binding
//! weaker than its parent is parenthesized even without an explicit
//! [`Expr::Nested`] node.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::EngineResult;

/// A literal value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Literal {
    /// Numeric literal, kept as written.
    Number(String),
    /// Single-quoted string literal.
    String(String),
    /// `TRUE` / `FALSE`.
    Boolean(bool),
    /// `NULL`.
    Null,
}

/// Binary operators, weakest binding first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    /// `OR`
    Or,
    /// `AND`
    And,
    /// `=`
    Eq,
    /// `<>`
    NotEq,
    /// `<`
    Lt,
    /// `<=`
    LtEq,
    /// `>`
    Gt,
    /// `>=`
    GtEq,
    /// `LIKE`
    Like,
    /// `NOT LIKE`
    NotLike,
    /// `+`
    Plus,
    /// `-`
    Minus,
    /// `*`
    Multiply,
    /// `/`
    Divide,
}

impl BinaryOp {
    fn precedence(self) -> u8 {
        match self {
            BinaryOp::Or => 1,
            BinaryOp::And => 2,
            BinaryOp::Eq
            | BinaryOp::NotEq
            | BinaryOp::Lt
            | BinaryOp::LtEq
            | BinaryOp::Gt
            | BinaryOp::GtEq
            | BinaryOp::Like
            | BinaryOp::NotLike => 3,
            BinaryOp::Plus | BinaryOp::Minus => 4,
            BinaryOp::Multiply | BinaryOp::Divide => 5,
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Or => "OR",
            BinaryOp::And => "AND",
            BinaryOp::Eq => "=",
            BinaryOp::NotEq => "<>",
            BinaryOp::Lt => "<",
            BinaryOp::LtEq => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::GtEq => ">=",
            BinaryOp::Like => "LIKE",
            BinaryOp::NotLike => "NOT LIKE",
            BinaryOp::Plus => "+",
            BinaryOp::Minus => "-",
            BinaryOp::Multiply => "*",
            BinaryOp::Divide => "/",
        }
    }
}

/// A (possibly qualified) column reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColumnRef {
    /// Table name or alias qualifier.
    pub table: Option<String>,
    /// Column name.
    pub name: String,
}

/// Scalar expression.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Expr {
    /// Column reference.
    Column(ColumnRef),
    /// Literal value.
    Literal(Literal),
    /// Named bind parameter (`:name`).
    Parameter(String),
    /// `left op right`.
    Binary {
        /// Left operand.
        left: Box<Expr>,
        /// Operator.
        op: BinaryOp,
        /// Right operand.
        right: Box<Expr>,
    },
    /// `NOT expr`.
    Not(Box<Expr>),
    /// `expr IS [NOT] NULL`.
    IsNull {
        /// Tested expression.
        expr: Box<Expr>,
        /// `IS NOT NULL` when true.
        negated: bool,
    },
    /// `expr [NOT] IN (list)`.
    InList {
        /// Tested expression.
        expr: Box<Expr>,
        /// Candidate values.
        list: Vec<Expr>,
        /// `NOT IN` when true.
        negated: bool,
    },
    /// `expr [NOT] BETWEEN low AND high`.
    Between {
        /// Tested expression.
        expr: Box<Expr>,
        /// Lower bound.
        low: Box<Expr>,
        /// Upper bound.
        high: Box<Expr>,
        /// `NOT BETWEEN` when true.
        negated: bool,
    },
    /// Function call, including aggregates.
    Function {
        /// Upper-case function name.
        name: String,
        /// Arguments.
        args: Vec<Expr>,
        /// `DISTINCT` modifier inside the call.
        distinct: bool,
    },
    /// `COUNT(*)`.
    CountStar,
    /// Explicit parentheses.
    Nested(Box<Expr>),
}

const AGGREGATES: [&str; 6] = ["COUNT", "SUM", "AVG", "MIN", "MAX", "GROUP_CONCAT"];

impl Expr {
    /// Unqualified column reference.
    pub fn column(name: impl Into<String>) -> Expr {
        Expr::Column(ColumnRef {
            table: None,
            name: name.into(),
        })
    }

    /// String literal.
    pub fn string(value: impl Into<String>) -> Expr {
        Expr::Literal(Literal::String(value.into()))
    }

    /// Numeric literal.
    pub fn number(value: impl ToString) -> Expr {
        Expr::Literal(Literal::Number(value.to_string()))
    }

    /// Bind parameter.
    pub fn param(name: impl Into<String>) -> Expr {
        Expr::Parameter(name.into())
    }

    /// Function call.
    pub fn function(name: &str, args: Vec<Expr>) -> Expr {
        Expr::Function {
            name: name.to_ascii_uppercase(),
            args,
            distinct: false,
        }
    }

    /// `self op right`.
    pub fn binary(self, op: BinaryOp, right: Expr) -> Expr {
        Expr::Binary {
            left: Box::new(self),
            op,
            right: Box::new(right),
        }
    }

    /// `self AND right`.
    pub fn and(self, right: Expr) -> Expr {
        self.binary(BinaryOp::And, right)
    }

    /// `self OR right`.
    pub fn or(self, right: Expr) -> Expr {
        self.binary(BinaryOp::Or, right)
    }

    /// `self = right`.
    pub fn eq(self, right: Expr) -> Expr {
        self.binary(BinaryOp::Eq, right)
    }

    /// `self <> right`.
    pub fn not_eq(self, right: Expr) -> Expr {
        self.binary(BinaryOp::NotEq, right)
    }

    /// `self < right`.
    pub fn lt(self, right: Expr) -> Expr {
        self.binary(BinaryOp::Lt, right)
    }

    /// `self > right`.
    pub fn gt(self, right: Expr) -> Expr {
        self.binary(BinaryOp::Gt, right)
    }

    /// `(self)`.
    pub fn nested(self) -> Expr {
        Expr::Nested(Box::new(self))
    }

    /// True for calls to aggregate functions and `COUNT(*)`.
    pub fn is_aggregate(&self) -> bool {
        match self {
            Expr::CountStar => true,
            Expr::Function { name, .. } => AGGREGATES.contains(&name.as_str()),
            Expr::Nested(inner) => inner.is_aggregate(),
            _ => false,
        }
    }

    /// Visit every column reference, depth first, left to right.
    pub fn visit_columns<'a>(&'a self, f: &mut impl FnMut(&'a ColumnRef)) {
        match self {
            Expr::Column(c) => f(c),
            Expr::Literal(_) | Expr::Parameter(_) | Expr::CountStar => {}
            Expr::Binary { left, right, .. } => {
                left.visit_columns(f);
                right.visit_columns(f);
            }
            Expr::Not(inner) | Expr::Nested(inner) => inner.visit_columns(f),
            Expr::IsNull { expr, .. } => expr.visit_columns(f),
            Expr::InList { expr, list, .. } => {
                expr.visit_columns(f);
                list.iter().for_each(|e| e.visit_columns(f));
            }
            Expr::Between {
                expr, low, high, ..
            } => {
                expr.visit_columns(f);
                low.visit_columns(f);
                high.visit_columns(f);
            }
            Expr::Function { args, .. } => args.iter().for_each(|e| e.visit_columns(f)),
        }
    }

    /// Rewrite the tree bottom-up: children first, then `f` on the rebuilt node.
    pub fn transform(self, f: &mut impl FnMut(Expr) -> EngineResult<Expr>) -> EngineResult<Expr> {
        let rebuilt = match self {
            Expr::Binary { left, op, right } => Expr::Binary {
                left: Box::new(left.transform(f)?),
                op,
                right: Box::new(right.transform(f)?),
            },
            Expr::Not(inner) => Expr::Not(Box::new(inner.transform(f)?)),
            Expr::Nested(inner) => Expr::Nested(Box::new(inner.transform(f)?)),
            Expr::IsNull { expr, negated } => Expr::IsNull {
                expr: Box::new(expr.transform(f)?),
                negated,
            },
            Expr::InList {
                expr,
                list,
                negated,
            } => Expr::InList {
                expr: Box::new(expr.transform(f)?),
                list: list
                    .into_iter()
                    .map(|e| e.transform(f))
                    .collect::<EngineResult<_>>()?,
                negated,
            },
            Expr::Between {
                expr,
                low,
                high,
                negated,
            } => Expr::Between {
                expr: Box::new(expr.transform(f)?),
                low: Box::new(low.transform(f)?),
                high: Box::new(high.transform(f)?),
                negated,
            },
            Expr::Function {
                name,
                args,
                distinct,
            } => Expr::Function {
                name,
                args: args
                    .into_iter()
                    .map(|e| e.transform(f))
                    .collect::<EngineResult<_>>()?,
                distinct,
            },
            leaf => leaf,
        };
        f(rebuilt)
    }

    fn precedence(&self) -> u8 {
        match self {
            Expr::Binary { op, .. } => op.precedence(),
            Expr::Between { .. } | Expr::InList { .. } | Expr::IsNull { .. } => 3,
            Expr::Not(_) => 2,
            _ => u8::MAX,
        }
    }
}

/// Write `name` as an identifier, double-quoting it when it is not a plain word.
fn write_identifier(f: &mut fmt::Formatter<'_>, name: &str) -> fmt::Result {
    let plain = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
        && !name.starts_with(|c: char| c.is_ascii_digit());
    if plain {
        f.write_str(name)
    } else {
        write!(f, "\"{}\"", name.replace('"', "\"\""))
    }
}

fn write_child(f: &mut fmt::Formatter<'_>, child: &Expr, parent: u8, strict: bool) -> fmt::Result {
    let p = child.precedence();
    if p < parent || (strict && p == parent && parent >= 3) {
        write!(f, "({child})")
    } else {
        write!(f, "{child}")
    }
}

fn write_list<T: fmt::Display>(f: &mut fmt::Formatter<'_>, items: &[T]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Number(n) => f.write_str(n),
            Literal::String(s) => write!(f, "'{}'", s.replace('\'', "''")),
            Literal::Boolean(true) => f.write_str("TRUE"),
            Literal::Boolean(false) => f.write_str("FALSE"),
            Literal::Null => f.write_str("NULL"),
        }
    }
}

impl fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(table) = &self.table {
            write_identifier(f, table)?;
            f.write_str(".")?;
        }
        write_identifier(f, &self.name)
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Column(c) => write!(f, "{c}"),
            Expr::Literal(l) => write!(f, "{l}"),
            Expr::Parameter(p) => write!(f, ":{p}"),
            Expr::Binary { left, op, right } => {
                let p = op.precedence();
                write_child(f, left, p, false)?;
                write!(f, " {} ", op.symbol())?;
                write_child(f, right, p, true)
            }
            Expr::Not(inner) => {
                f.write_str("NOT ")?;
                write_child(f, inner, 3, false)
            }
            Expr::IsNull { expr, negated } => {
                write_child(f, expr, 4, false)?;
                f.write_str(if *negated { " IS NOT NULL" } else { " IS NULL" })
            }
            Expr::InList {
                expr,
                list,
                negated,
            } => {
                write_child(f, expr, 4, false)?;
                f.write_str(if *negated { " NOT IN (" } else { " IN (" })?;
                write_list(f, list)?;
                f.write_str(")")
            }
            Expr::Between {
                expr,
                low,
                high,
                negated,
            } => {
                write_child(f, expr, 4, false)?;
                f.write_str(if *negated { " NOT BETWEEN " } else { " BETWEEN " })?;
                write_child(f, low, 4, false)?;
                f.write_str(" AND ")?;
                write_child(f, high, 4, false)
            }
            Expr::Function {
                name,
                args,
                distinct,
            } => {
                write!(f, "{name}(")?;
                if *distinct {
                    f.write_str("DISTINCT ")?;
                }
                write_list(f, args)?;
                f.write_str(")")
            }
            Expr::CountStar => f.write_str("COUNT(*)"),
            Expr::Nested(inner) => write!(f, "({inner})"),
        }
    }
}

/// One projected item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SelectItem {
    /// `*`
    Wildcard,
    /// `expr [AS alias]`
    Expr {
        /// Projected expression.
        expr: Expr,
        /// Optional alias.
        alias: Option<String>,
    },
}

impl SelectItem {
    /// Un-aliased projection of `expr`.
    pub fn expr(expr: Expr) -> Self {
        SelectItem::Expr { expr, alias: None }
    }

    /// Aliased projection of `expr`.
    pub fn aliased(expr: Expr, alias: impl Into<String>) -> Self {
        SelectItem::Expr {
            expr,
            alias: Some(alias.into()),
        }
    }
}

impl fmt::Display for SelectItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectItem::Wildcard => f.write_str("*"),
            SelectItem::Expr { expr, alias } => {
                write!(f, "{expr}")?;
                if let Some(alias) = alias {
                    f.write_str(" AS ")?;
                    write_identifier(f, alias)?;
                }
                Ok(())
            }
        }
    }
}

/// A table in `FROM` or a join.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableRef {
    /// Table name (`syn123`, `syn123.4`, or a physical name after translation).
    pub name: String,
    /// Optional alias.
    pub alias: Option<String>,
}

impl TableRef {
    /// Un-aliased table.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            alias: None,
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_identifier(f, &self.name)?;
        if let Some(alias) = &self.alias {
            f.write_str(" ")?;
            write_identifier(f, alias)?;
        }
        Ok(())
    }
}

/// Join flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JoinKind {
    /// `JOIN`
    Inner,
    /// `LEFT JOIN`
    Left,
}

/// A joined table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Join {
    /// Join flavour.
    pub kind: JoinKind,
    /// Joined table.
    pub table: TableRef,
    /// Join condition.
    pub on: Expr,
}

/// One `ORDER BY` item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderByItem {
    /// Sort key.
    pub expr: Expr,
    /// Ascending when true.
    pub ascending: bool,
}

/// A named common table expression.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommonTableExpression {
    /// Name the outer query refers to.
    pub name: String,
    /// Column names, positionally matching the defining query's projection.
    pub columns: Vec<String>,
    /// Defining query.
    pub query: Box<QuerySpec>,
}

/// A SELECT statement.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QuerySpec {
    /// Common table expressions, innermost first.
    pub with: Vec<CommonTableExpression>,
    /// `SELECT DISTINCT` when true.
    pub distinct: bool,
    /// Projection.
    pub select: Vec<SelectItem>,
    /// Primary table.
    pub from: TableRef,
    /// Joined tables.
    pub joins: Vec<Join>,
    /// `WHERE` condition.
    pub where_clause: Option<Expr>,
    /// `GROUP BY` keys.
    pub group_by: Vec<Expr>,
    /// `HAVING` condition.
    pub having: Option<Expr>,
    /// `ORDER BY` keys.
    pub order_by: Vec<OrderByItem>,
    /// `LIMIT`.
    pub limit: Option<u64>,
    /// `OFFSET`.
    pub offset: Option<u64>,
}

impl QuerySpec {
    /// `SELECT <items> FROM <table>`.
    pub fn select(items: Vec<SelectItem>, table: impl Into<String>) -> Self {
        Self {
            with: Vec::new(),
            distinct: false,
            select: items,
            from: TableRef::named(table),
            joins: Vec::new(),
            where_clause: None,
            group_by: Vec::new(),
            having: None,
            order_by: Vec::new(),
            limit: None,
            offset: None,
        }
    }

    /// `SELECT * FROM <table>`.
    pub fn select_star(table: impl Into<String>) -> Self {
        Self::select(vec![SelectItem::Wildcard], table)
    }

    /// `SELECT <columns> FROM <table>`.
    pub fn select_columns(columns: &[&str], table: impl Into<String>) -> Self {
        Self::select(
            columns
                .iter()
                .map(|c| SelectItem::expr(Expr::column(*c)))
                .collect(),
            table,
        )
    }

    /// Set the `WHERE` clause.
    pub fn with_where(mut self, condition: Expr) -> Self {
        self.where_clause = Some(condition);
        self
    }

    /// Append an `ORDER BY` key.
    pub fn with_order_by(mut self, expr: Expr, ascending: bool) -> Self {
        self.order_by.push(OrderByItem { expr, ascending });
        self
    }

    /// Set `LIMIT` / `OFFSET`.
    pub fn with_pagination(mut self, limit: Option<u64>, offset: Option<u64>) -> Self {
        self.limit = limit;
        self.offset = offset;
        self
    }

    /// Set `GROUP BY` keys.
    pub fn with_group_by(mut self, keys: Vec<Expr>) -> Self {
        self.group_by = keys;
        self
    }

    /// Mark as `SELECT DISTINCT`.
    pub fn with_distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    /// True when every projected item is an aggregate and nothing is grouped.
    pub fn is_simple_aggregate(&self) -> bool {
        self.group_by.is_empty()
            && !self.select.is_empty()
            && self.select.iter().all(|item| match item {
                SelectItem::Wildcard => false,
                SelectItem::Expr { expr, .. } => expr.is_aggregate(),
            })
    }

    /// True when any projection is `*`.
    pub fn has_wildcard(&self) -> bool {
        self.select.iter().any(|i| matches!(i, SelectItem::Wildcard))
    }

    /// Visit every column reference in projection, joins, filters, grouping and ordering.
    pub fn visit_columns<'a>(&'a self, f: &mut impl FnMut(&'a ColumnRef)) {
        for item in &self.select {
            if let SelectItem::Expr { expr, .. } = item {
                expr.visit_columns(f);
            }
        }
        for join in &self.joins {
            join.on.visit_columns(f);
        }
        if let Some(w) = &self.where_clause {
            w.visit_columns(f);
        }
        self.group_by.iter().for_each(|e| e.visit_columns(f));
        if let Some(h) = &self.having {
            h.visit_columns(f);
        }
        self.order_by.iter().for_each(|o| o.expr.visit_columns(f));
    }

    /// Apply `f` bottom-up to every expression of the statement (not its CTEs).
    pub fn transform_exprs(
        &mut self,
        f: &mut impl FnMut(Expr) -> EngineResult<Expr>,
    ) -> EngineResult<()> {
        for item in &mut self.select {
            if let SelectItem::Expr { expr, .. } = item {
                *expr = take_expr(expr).transform(f)?;
            }
        }
        for join in &mut self.joins {
            join.on = take_expr(&mut join.on).transform(f)?;
        }
        if let Some(w) = self.where_clause.take() {
            self.where_clause = Some(w.transform(f)?);
        }
        for key in &mut self.group_by {
            *key = take_expr(key).transform(f)?;
        }
        if let Some(h) = self.having.take() {
            self.having = Some(h.transform(f)?);
        }
        for order in &mut self.order_by {
            order.expr = take_expr(&mut order.expr).transform(f)?;
        }
        Ok(())
    }
}

fn take_expr(expr: &mut Expr) -> Expr {
    std::mem::replace(expr, Expr::Literal(Literal::Null))
}

impl fmt::Display for QuerySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.with.is_empty() {
            f.write_str("WITH ")?;
            for (i, cte) in self.with.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write_identifier(f, &cte.name)?;
                if !cte.columns.is_empty() {
                    f.write_str(" (")?;
                    for (j, column) in cte.columns.iter().enumerate() {
                        if j > 0 {
                            f.write_str(", ")?;
                        }
                        write_identifier(f, column)?;
                    }
                    f.write_str(")")?;
                }
                write!(f, " AS ({})", cte.query)?;
            }
            f.write_str(" ")?;
        }
        f.write_str("SELECT ")?;
        if self.distinct {
            f.write_str("DISTINCT ")?;
        }
        write_list(f, &self.select)?;
        write!(f, " FROM {}", self.from)?;
        for join in &self.joins {
            let kw = match join.kind {
                JoinKind::Inner => "JOIN",
                JoinKind::Left => "LEFT JOIN",
            };
            write!(f, " {kw} {} ON {}", join.table, join.on)?;
        }
        if let Some(w) = &self.where_clause {
            write!(f, " WHERE {w}")?;
        }
        if !self.group_by.is_empty() {
            f.write_str(" GROUP BY ")?;
            write_list(f, &self.group_by)?;
        }
        if let Some(h) = &self.having {
            write!(f, " HAVING {h}")?;
        }
        if !self.order_by.is_empty() {
            f.write_str(" ORDER BY ")?;
            for (i, o) in self.order_by.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{}", o.expr)?;
                if !o.ascending {
                    f.write_str(" DESC")?;
                }
            }
        }
        if let Some(limit) = self.limit {
            write!(f, " LIMIT {limit}")?;
        }
        if let Some(offset) = self.offset {
            write!(f, " OFFSET {offset}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== Rendering tests ====================

    #[test]
    fn renders_basic_select() {
        let q = QuerySpec::select_columns(&["a", "b"], "syn1")
            .with_where(Expr::column("a").gt(Expr::number(3)))
            .with_order_by(Expr::column("b"), false)
            .with_pagination(Some(10), Some(5));
        assert_eq!(
            q.to_string(),
            "SELECT a, b FROM syn1 WHERE a > 3 ORDER BY b DESC LIMIT 10 OFFSET 5"
        );
    }

    #[test]
    fn weaker_children_are_parenthesized() {
        let or = Expr::column("a")
            .eq(Expr::number(1))
            .or(Expr::column("b").eq(Expr::number(2)));
        let and = or.and(Expr::column("c").eq(Expr::number(3)));
        assert_eq!(and.to_string(), "(a = 1 OR b = 2) AND c = 3");
    }

    #[test]
    fn quotes_identifiers_and_escapes_strings() {
        let expr = Expr::column("my col").eq(Expr::string("it's"));
        assert_eq!(expr.to_string(), "\"my col\" = 'it''s'");
    }

    #[test]
    fn renders_named_cte_columns() {
        let mut q = QuerySpec::select_columns(&["_C1_"], "T2");
        q.with.push(CommonTableExpression {
            name: "T2".to_string(),
            columns: vec!["_C1_".to_string()],
            query: Box::new(QuerySpec::select_columns(&["_C1_"], "T1")),
        });
        assert_eq!(
            q.to_string(),
            "WITH T2 (_C1_) AS (SELECT _C1_ FROM T1) SELECT _C1_ FROM T2"
        );
    }

    #[test]
    fn detects_simple_aggregates() {
        let count = QuerySpec::select(vec![SelectItem::expr(Expr::CountStar)], "syn1");
        assert!(count.is_simple_aggregate());
        let grouped = count.clone().with_group_by(vec![Expr::column("a")]);
        assert!(!grouped.is_simple_aggregate());
        assert!(!QuerySpec::select_star("syn1").is_simple_aggregate());
    }

    // ==================== Traversal tests ====================

    #[test]
    fn visits_columns_in_every_clause() {
        let q = QuerySpec::select_columns(&["a"], "syn1")
            .with_where(Expr::column("b").eq(Expr::number(1)))
            .with_group_by(vec![Expr::column("c")])
            .with_order_by(Expr::column("d"), true);
        let mut seen = Vec::new();
        q.visit_columns(&mut |c| seen.push(c.name.clone()));
        assert_eq!(seen, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn transform_rewrites_bottom_up() -> EngineResult<()> {
        let mut q = QuerySpec::select_star("syn1").with_where(
            Expr::column("a")
                .eq(Expr::string("x"))
                .and(Expr::column("b").lt(Expr::number(2))),
        );
        q.transform_exprs(&mut |e| {
            Ok(match e {
                Expr::Column(c) => Expr::column(format!("_{}_", c.name)),
                other => other,
            })
        })?;
        assert_eq!(q.to_string(), "SELECT * FROM syn1 WHERE _a_ = 'x' AND _b_ < 2");
        Ok(())
    }
}
