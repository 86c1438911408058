use sqlparser::ast::{BinaryOperator, Expr as SqlExpr, Ident, UnaryOperator, Value};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::{Parser, ParserError};
use sqlparser::tokenizer::Token;

use crate::error::{LakeError, LakeResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

impl CompareOp {
    fn from_sql(op: &BinaryOperator) -> Option<Self> {
        match op {
            BinaryOperator::Eq => Some(CompareOp::Eq),
            BinaryOperator::NotEq => Some(CompareOp::NotEq),
            BinaryOperator::Lt => Some(CompareOp::Lt),
            BinaryOperator::LtEq => Some(CompareOp::LtEq),
            BinaryOperator::Gt => Some(CompareOp::Gt),
            BinaryOperator::GtEq => Some(CompareOp::GtEq),
            _ => None,
        }
    }

    /// Operator for the same comparison with its operands swapped.
    fn flip(self) -> Self {
        match self {
            CompareOp::Eq => CompareOp::Eq,
            CompareOp::NotEq => CompareOp::NotEq,
            CompareOp::Lt => CompareOp::Gt,
            CompareOp::LtEq => CompareOp::GtEq,
            CompareOp::Gt => CompareOp::Lt,
            CompareOp::GtEq => CompareOp::LtEq,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Number(f64),
    Text(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Comparison {
    pub column: String,
    pub op: CompareOp,
    pub literal: Literal,
}

/// Parses one whole SQL expression; trailing tokens are an error.
fn parse_condition(sql: &str) -> Result<SqlExpr, ParserError> {
    let dialect = GenericDialect {};
    let mut parser = Parser::new(&dialect).try_with_sql(sql)?;
    let expr = parser.parse_expr()?;
    parser.expect_token(&Token::EOF)?;
    Ok(expr)
}

fn conjuncts<'e>(expr: &'e SqlExpr, out: &mut Vec<&'e SqlExpr>) {
    match expr {
        SqlExpr::BinaryOp { left, op: BinaryOperator::And, right } => {
            conjuncts(left, out);
            conjuncts(right, out);
        },
        SqlExpr::Nested(inner) => conjuncts(inner, out),
        other => out.push(other),
    }
}

fn column_name(expr: &SqlExpr) -> Option<String> {
    match expr {
        SqlExpr::Identifier(ident) => Some(ident.value.clone()),
        SqlExpr::Nested(inner) => column_name(inner),
        _ => None,
    }
}

fn literal(expr: &SqlExpr) -> Option<Literal> {
    match expr {
        SqlExpr::Value(Value::Number(n, _)) => n.parse::<f64>().ok().map(Literal::Number),
        SqlExpr::Value(Value::SingleQuotedString(s)) => Some(Literal::Text(s.clone())),
        SqlExpr::UnaryOp { op: UnaryOperator::Minus, expr } => match literal(expr)? {
            Literal::Number(n) => Some(Literal::Number(-n)),
            Literal::Text(_) => None,
        },
        SqlExpr::UnaryOp { op: UnaryOperator::Plus, expr } => match literal(expr)? {
            Literal::Number(n) => Some(Literal::Number(n)),
            Literal::Text(_) => None,
        },
        SqlExpr::Nested(inner) => literal(inner),
        _ => None,
    }
}

fn comparison(expr: &SqlExpr) -> Option<Comparison> {
    let (left, op, right) = match expr {
        SqlExpr::BinaryOp { left, op, right } => (left, CompareOp::from_sql(op)?, right),
        _ => return None,
    };
    if let (Some(column), Some(literal)) = (column_name(left), literal(right)) {
        return Some(Comparison { column, op, literal });
    }
    let (column, literal) = (column_name(right)?, literal(left)?);
    Some(Comparison { column, op: op.flip(), literal })
}

/// Extracts the `column <op> literal` comparisons of a top-level conjunction.
///
/// Conjuncts that are not a plain comparison are left out, which is safe for
/// pruning because every kept comparison must hold for a row to match. A
/// filter that does not parse, or whose top level is not an AND chain, yields
/// at most the single comparison it is made of.
pub fn prunable_comparisons(filter: &str) -> Vec<Comparison> {
    let expr = match parse_condition(filter) {
        Ok(expr) => expr,
        Err(_) => return Vec::new(),
    };
    let mut terms = Vec::new();
    conjuncts(&expr, &mut terms);
    terms.into_iter().filter_map(comparison).collect()
}

/// Equality join condition of a merge, e.g. `target.id = source.id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergePredicate {
    pub target_keys: Vec<String>,
    pub source_keys: Vec<String>,
}

fn qualified(expr: &SqlExpr) -> Option<(&str, &str)> {
    match expr {
        SqlExpr::CompoundIdentifier(idents) => match idents.as_slice() {
            [Ident { value: alias, .. }, Ident { value: column, .. }] => Some((alias.as_str(), column.as_str())),
            _ => None,
        },
        SqlExpr::Nested(inner) => qualified(inner),
        _ => None,
    }
}

impl MergePredicate {
    pub fn parse(predicate: &str, target_alias: &str, source_alias: &str) -> LakeResult<Self> {
        let invalid = |why: &str| LakeError::InvalidArgument(format!("merge condition {predicate:?}: {why}"));
        if target_alias == source_alias {
            return Err(invalid("target and source aliases must differ"));
        }
        let expr = parse_condition(predicate).map_err(|e| invalid(&e.to_string()))?;
        let mut terms = Vec::new();
        conjuncts(&expr, &mut terms);

        let mut target_keys = Vec::new();
        let mut source_keys = Vec::new();
        for term in terms {
            let (left, right) = match term {
                SqlExpr::BinaryOp { left, op: BinaryOperator::Eq, right } => match (qualified(left), qualified(right)) {
                    (Some(l), Some(r)) => (l, r),
                    _ => return Err(invalid("expected `<alias>.<column> = <alias>.<column>` terms joined by AND")),
                },
                _ => return Err(invalid("expected `<alias>.<column> = <alias>.<column>` terms joined by AND")),
            };
            let (t, s) = if left.0 == target_alias && right.0 == source_alias {
                (left.1, right.1)
            } else if left.0 == source_alias && right.0 == target_alias {
                (right.1, left.1)
            } else {
                return Err(invalid(&format!("each term must compare {target_alias} with {source_alias}")));
            };
            target_keys.push(t.to_string());
            source_keys.push(s.to_string());
        }
        Ok(Self { target_keys, source_keys })
    }
}
