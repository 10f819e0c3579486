//! 规范查询（Canonical Query）的数据模型
//!
//! 每个请求只会被解释为下面四种变体之一。`SimpleFilter` 保留 LLM 给出的
//! 扁平前缀序列，编译前由 [`SimpleFilter::to_expr`] 折叠为布尔表达式树。

use serde::{Deserialize, Serialize};
use std::fmt;

/// 规范查询：四种变体之一
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CanonicalQuery {
    SimpleFilter(SimpleFilter),
    CountAggregate(CountAggregate),
    Exclusion(Exclusion),
    RawQuery(RawQuery),
}

impl CanonicalQuery {
    pub fn kind(&self) -> &'static str {
        match self {
            CanonicalQuery::SimpleFilter(_) => "simple_filter",
            CanonicalQuery::CountAggregate(_) => "count_aggregate",
            CanonicalQuery::Exclusion(_) => "exclusion",
            CanonicalQuery::RawQuery(_) => "raw_query",
        }
    }
}

impl fmt::Display for CanonicalQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CanonicalQuery::SimpleFilter(filter) => write!(f, "{}", filter),
            CanonicalQuery::CountAggregate(agg) => write!(
                f,
                "count({}.{} -> {}) {} {}",
                agg.secondary_model,
                agg.link_field,
                agg.primary_model,
                agg.comparison.as_str(),
                agg.threshold
            ),
            CanonicalQuery::Exclusion(ex) => write!(
                f,
                "{} without {}.{}",
                ex.primary_model, ex.secondary_model, ex.link_field
            ),
            CanonicalQuery::RawQuery(raw) => write!(f, "{}", raw.sql),
        }
    }
}

/// 简单过滤：有序的子句与前缀逻辑标记序列
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SimpleFilter {
    pub terms: Vec<FilterTerm>,
}

/// 序列中的一个元素：子句，或前缀形式的逻辑标记
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterTerm {
    Clause(Clause),
    /// `&`，二元
    And,
    /// `|`，二元
    Or,
    /// `!`，一元
    Not,
}

impl FilterTerm {
    pub fn marker(&self) -> Option<&'static str> {
        match self {
            FilterTerm::Clause(_) => None,
            FilterTerm::And => Some("&"),
            FilterTerm::Or => Some("|"),
            FilterTerm::Not => Some("!"),
        }
    }
}

/// 基础子句 `(field_path, operator, value)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Clause {
    pub field: String,
    pub op: FilterOp,
    pub value: Literal,
}

impl Clause {
    pub fn new(field: impl Into<String>, op: FilterOp, value: Literal) -> Self {
        Self {
            field: field.into(),
            op,
            value,
        }
    }

    /// 路径中第一个关联分隔符之前的部分
    pub fn base_field(&self) -> &str {
        self.field.split('.').next().unwrap_or(&self.field)
    }

    /// 跨关联时，基础字段之后的剩余路径
    pub fn relation_tail(&self) -> Option<&str> {
        self.field.split_once('.').map(|(_, tail)| tail)
    }
}

/// 比较运算符
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FilterOp {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=")]
    NotEq,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">=")]
    Gte,
    #[serde(rename = "<=")]
    Lte,
    #[serde(rename = "contains")]
    Contains,
    #[serde(rename = "icontains")]
    IContains,
    #[serde(rename = "in")]
    In,
    #[serde(rename = "not_in")]
    NotIn,
}

impl FilterOp {
    pub const ALL: [FilterOp; 10] = [
        FilterOp::Eq,
        FilterOp::NotEq,
        FilterOp::Gt,
        FilterOp::Lt,
        FilterOp::Gte,
        FilterOp::Lte,
        FilterOp::Contains,
        FilterOp::IContains,
        FilterOp::In,
        FilterOp::NotIn,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOp::Eq => "=",
            FilterOp::NotEq => "!=",
            FilterOp::Gt => ">",
            FilterOp::Lt => "<",
            FilterOp::Gte => ">=",
            FilterOp::Lte => "<=",
            FilterOp::Contains => "contains",
            FilterOp::IContains => "icontains",
            FilterOp::In => "in",
            FilterOp::NotIn => "not_in",
        }
    }

    /// 解析运算符，同时接受常见的别名（`ilike`、`not in`、`==` 等）
    pub fn parse(s: &str) -> Option<FilterOp> {
        let normalized = s.trim().to_ascii_lowercase();
        let op = match normalized.as_str() {
            "=" | "==" => FilterOp::Eq,
            "!=" | "<>" => FilterOp::NotEq,
            ">" => FilterOp::Gt,
            "<" => FilterOp::Lt,
            ">=" => FilterOp::Gte,
            "<=" => FilterOp::Lte,
            "contains" | "like" => FilterOp::Contains,
            "icontains" | "ilike" => FilterOp::IContains,
            "in" => FilterOp::In,
            "not_in" | "not in" => FilterOp::NotIn,
            _ => return None,
        };
        Some(op)
    }

    /// `in` / `not_in` 的右侧必须是列表
    pub fn expects_list(&self) -> bool {
        matches!(self, FilterOp::In | FilterOp::NotIn)
    }

    /// 取反后的运算符；`contains`/`icontains` 没有对应的取反运算符
    pub fn negated(&self) -> Option<FilterOp> {
        let op = match self {
            FilterOp::Eq => FilterOp::NotEq,
            FilterOp::NotEq => FilterOp::Eq,
            FilterOp::Gt => FilterOp::Lte,
            FilterOp::Lt => FilterOp::Gte,
            FilterOp::Gte => FilterOp::Lt,
            FilterOp::Lte => FilterOp::Gt,
            FilterOp::In => FilterOp::NotIn,
            FilterOp::NotIn => FilterOp::In,
            FilterOp::Contains | FilterOp::IContains => return None,
        };
        Some(op)
    }
}

/// 字面量值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Literal {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    List(Vec<Literal>),
}

impl Literal {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Literal::Integer(n) => Some(*n),
            _ => None,
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Null => write!(f, "None"),
            Literal::Bool(true) => write!(f, "True"),
            Literal::Bool(false) => write!(f, "False"),
            Literal::Integer(n) => write!(f, "{}", n),
            // Debug 输出总带小数点或指数，重新词法分析时仍是浮点数
            Literal::Float(x) => write!(f, "{:?}", x),
            Literal::String(s) => write_quoted(f, s),
            Literal::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
        }
    }
}

fn write_quoted(f: &mut fmt::Formatter<'_>, s: &str) -> fmt::Result {
    write!(f, "'")?;
    for c in s.chars() {
        match c {
            '\\' => write!(f, "\\\\")?,
            '\'' => write!(f, "\\'")?,
            c => write!(f, "{}", c)?,
        }
    }
    write!(f, "'")
}

/// 规范文本形式，例如 `['|', ('active', '=', True), ('name', 'icontains', 'acme')]`
impl fmt::Display for SimpleFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, term) in self.terms.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match term {
                FilterTerm::Clause(clause) => {
                    write!(f, "(")?;
                    write_quoted(f, &clause.field)?;
                    write!(f, ", '{}', {})", clause.op.as_str(), clause.value)?;
                }
                marker => write!(f, "'{}'", marker.marker().unwrap_or_default())?,
            }
        }
        write!(f, "]")
    }
}

/// 由前缀序列折叠出的布尔表达式树
#[derive(Debug, Clone, PartialEq)]
pub enum FilterExpr {
    /// 空过滤，匹配全部记录
    All,
    Clause(Clause),
    And(Box<FilterExpr>, Box<FilterExpr>),
    Or(Box<FilterExpr>, Box<FilterExpr>),
    Not(Box<FilterExpr>),
}

/// 逻辑标记之后缺少足够的操作数
#[derive(Debug, Clone, PartialEq)]
pub struct ArityError {
    pub marker: &'static str,
    /// 出错的标记在序列中的下标
    pub position: usize,
}

impl fmt::Display for ArityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "logical marker '{}' at position {} is missing operands",
            self.marker, self.position
        )
    }
}

impl SimpleFilter {
    pub fn new(terms: Vec<FilterTerm>) -> Self {
        Self { terms }
    }

    pub fn match_all() -> Self {
        Self::default()
    }

    pub fn clauses(&self) -> impl Iterator<Item = &Clause> {
        self.terms.iter().filter_map(|term| match term {
            FilterTerm::Clause(clause) => Some(clause),
            _ => None,
        })
    }

    pub fn clauses_mut(&mut self) -> impl Iterator<Item = &mut Clause> {
        self.terms.iter_mut().filter_map(|term| match term {
            FilterTerm::Clause(clause) => Some(clause),
            _ => None,
        })
    }

    pub fn is_match_all(&self) -> bool {
        self.terms.is_empty()
    }

    /// 将前缀序列折叠为表达式树
    ///
    /// 从右向左扫描并维护操作数栈：子句入栈，`!` 包裹栈顶，`&`/`|` 合并栈顶两个。
    /// 栈中剩余的操作数按从左到右的顺序隐式 AND。
    pub fn to_expr(&self) -> Result<FilterExpr, ArityError> {
        let mut stack: Vec<FilterExpr> = Vec::new();

        for (position, term) in self.terms.iter().enumerate().rev() {
            match term {
                FilterTerm::Clause(clause) => stack.push(FilterExpr::Clause(clause.clone())),
                FilterTerm::Not => {
                    let operand = stack.pop().ok_or(ArityError { marker: "!", position })?;
                    stack.push(FilterExpr::Not(Box::new(operand)));
                }
                FilterTerm::And | FilterTerm::Or => {
                    let marker = term.marker().unwrap_or_default();
                    if stack.len() < 2 {
                        return Err(ArityError { marker, position });
                    }
                    let (Some(left), Some(right)) = (stack.pop(), stack.pop()) else {
                        return Err(ArityError { marker, position });
                    };
                    let combined = if matches!(term, FilterTerm::And) {
                        FilterExpr::And(Box::new(left), Box::new(right))
                    } else {
                        FilterExpr::Or(Box::new(left), Box::new(right))
                    };
                    stack.push(combined);
                }
            }
        }

        let Some(mut expr) = stack.pop() else {
            return Ok(FilterExpr::All);
        };
        while let Some(next) = stack.pop() {
            expr = FilterExpr::And(Box::new(expr), Box::new(next));
        }
        Ok(expr)
    }
}

/// 计数聚合的比较运算符
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CountComparison {
    #[serde(rename = ">=")]
    Gte,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<=")]
    Lte,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "=")]
    Eq,
}

impl CountComparison {
    /// 结构化响应省略运算符时使用
    pub const DEFAULT: CountComparison = CountComparison::Gte;

    pub fn parse(s: &str) -> Option<CountComparison> {
        match s.trim() {
            ">=" => Some(CountComparison::Gte),
            ">" => Some(CountComparison::Gt),
            "<=" => Some(CountComparison::Lte),
            "<" => Some(CountComparison::Lt),
            "=" | "==" => Some(CountComparison::Eq),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CountComparison::Gte => ">=",
            CountComparison::Gt => ">",
            CountComparison::Lte => "<=",
            CountComparison::Lt => "<",
            CountComparison::Eq => "=",
        }
    }

    pub fn matches(&self, count: u64, threshold: u64) -> bool {
        match self {
            CountComparison::Gte => count >= threshold,
            CountComparison::Gt => count > threshold,
            CountComparison::Lte => count <= threshold,
            CountComparison::Lt => count < threshold,
            CountComparison::Eq => count == threshold,
        }
    }
}

/// 主实体中，关联次实体记录数量满足阈值的记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountAggregate {
    pub primary_model: String,
    pub secondary_model: String,
    /// 次实体上指向主实体的关联字段
    pub link_field: String,
    pub threshold: u64,
    pub comparison: CountComparison,
}

/// 主实体中，没有任何关联次实体记录的记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exclusion {
    pub primary_model: String,
    pub secondary_model: String,
    pub link_field: String,
}

/// 已通过安全校验的只读 SQL 语句
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawQuery {
    pub entity_type: String,
    pub table: String,
    pub sql: String,
    pub params: Vec<Literal>,
}
