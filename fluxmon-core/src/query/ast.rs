//! Expression tree

use crate::{Matcher, Timestamp};
use std::fmt;

/// Type an expression evaluates to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Scalar,
    String,
    Vector,
    Matrix,
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ValueType::Scalar => "scalar",
            ValueType::String => "string",
            ValueType::Vector => "instant vector",
            ValueType::Matrix => "range vector",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    String(String),
    VectorSelector(VectorSelector),
    MatrixSelector(MatrixSelector),
    Call(Call),
    Aggregate(Aggregate),
    Binary(Binary),
    /// Unary minus
    Neg(Box<Expr>),
    Paren(Box<Expr>),
}

impl Expr {
    pub fn value_type(&self) -> ValueType {
        match self {
            Expr::Number(_) => ValueType::Scalar,
            Expr::String(_) => ValueType::String,
            Expr::VectorSelector(_) => ValueType::Vector,
            Expr::MatrixSelector(_) => ValueType::Matrix,
            Expr::Call(call) => call.func.return_type,
            Expr::Aggregate(_) => ValueType::Vector,
            Expr::Binary(b) => {
                if b.lhs.value_type() == ValueType::Scalar && b.rhs.value_type() == ValueType::Scalar {
                    ValueType::Scalar
                } else {
                    ValueType::Vector
                }
            }
            Expr::Neg(e) | Expr::Paren(e) => e.value_type(),
        }
    }

    /// Visit every vector selector, including those inside matrix selectors
    pub fn selectors<'a>(&'a self, out: &mut Vec<SelectorUse<'a>>) {
        match self {
            Expr::VectorSelector(vs) => out.push(SelectorUse { selector: vs, range: 0 }),
            Expr::MatrixSelector(ms) => out.push(SelectorUse {
                selector: &ms.selector,
                range: ms.range,
            }),
            Expr::Call(call) => call.args.iter().for_each(|a| a.selectors(out)),
            Expr::Aggregate(agg) => {
                agg.expr.selectors(out);
                if let Some(p) = &agg.param {
                    p.selectors(out);
                }
            }
            Expr::Binary(b) => {
                b.lhs.selectors(out);
                b.rhs.selectors(out);
            }
            Expr::Neg(e) | Expr::Paren(e) => e.selectors(out),
            Expr::Number(_) | Expr::String(_) => {}
        }
    }
}

/// A selector reached while walking an expression, with its range (0 for
/// instant selectors)
pub struct SelectorUse<'a> {
    pub selector: &'a VectorSelector,
    pub range: Timestamp,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VectorSelector {
    pub name: Option<String>,
    /// Includes the `__name__` matcher when a name was given
    pub matchers: Vec<Matcher>,
    pub offset: Timestamp,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatrixSelector {
    pub selector: VectorSelector,
    pub range: Timestamp,
}

/// Builtin function signature
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Function {
    pub name: &'static str,
    pub arg_types: &'static [ValueType],
    /// Number of trailing arguments that may be omitted
    pub optional_args: usize,
    pub return_type: ValueType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub func: Function,
    pub args: Vec<Expr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateOp {
    Sum,
    Avg,
    Min,
    Max,
    Count,
    Group,
    Stddev,
    Stdvar,
    Quantile,
    Topk,
    Bottomk,
}

impl AggregateOp {
    pub fn from_name(name: &str) -> Option<Self> {
        let op = match name {
            "sum" => AggregateOp::Sum,
            "avg" => AggregateOp::Avg,
            "min" => AggregateOp::Min,
            "max" => AggregateOp::Max,
            "count" => AggregateOp::Count,
            "group" => AggregateOp::Group,
            "stddev" => AggregateOp::Stddev,
            "stdvar" => AggregateOp::Stdvar,
            "quantile" => AggregateOp::Quantile,
            "topk" => AggregateOp::Topk,
            "bottomk" => AggregateOp::Bottomk,
            _ => return None,
        };
        Some(op)
    }

    pub fn takes_param(&self) -> bool {
        matches!(self, AggregateOp::Quantile | AggregateOp::Topk | AggregateOp::Bottomk)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Grouping {
    By(Vec<String>),
    Without(Vec<String>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Aggregate {
    pub op: AggregateOp,
    pub expr: Box<Expr>,
    pub param: Option<Box<Expr>>,
    /// `None` aggregates everything into one group
    pub grouping: Option<Grouping>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Unless,
}

impl BinaryOp {
    /// Binding strength, higher binds tighter
    pub fn precedence(&self) -> u8 {
        match self {
            BinaryOp::Or => 1,
            BinaryOp::And | BinaryOp::Unless => 2,
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => 3,
            BinaryOp::Add | BinaryOp::Sub => 4,
            BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => 5,
            BinaryOp::Pow => 6,
        }
    }

    pub fn is_right_associative(&self) -> bool {
        matches!(self, BinaryOp::Pow)
    }

    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge
        )
    }

    pub fn is_set(&self) -> bool {
        matches!(self, BinaryOp::And | BinaryOp::Or | BinaryOp::Unless)
    }
}

/// How many series on each side of a vector operation may match
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cardinality {
    OneToOne,
    /// `group_left`: many on the left, with labels copied from the right
    ManyToOne(Vec<String>),
    /// `group_right`
    OneToMany(Vec<String>),
    ManyToMany,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VectorMatching {
    pub card: Cardinality,
    /// `on(...)` when true, `ignoring(...)` otherwise
    pub on: bool,
    pub labels: Vec<String>,
}

impl Default for VectorMatching {
    fn default() -> Self {
        Self {
            card: Cardinality::OneToOne,
            on: false,
            labels: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Binary {
    pub op: BinaryOp,
    pub lhs: Box<Expr>,
    pub rhs: Box<Expr>,
    /// Comparison returns 0/1 instead of filtering
    pub return_bool: bool,
    pub matching: VectorMatching,
}
