//! 子句列表的语法分析器
//!
//! ## 语法
//!
//! ```text
//! filter   := '[' (term (',' term)* ','?)? ']'
//! term     := clause | marker
//! clause   := open literal ',' literal ',' value ','? close     // open/close: '(' ')' 或 '[' ']'
//! marker   := '&' | '|' | '!' | 'AND' | 'OR' | 'NOT'             // 必须加引号
//! value    := string | integer | float | True | False | None | sequence
//! sequence := open (value (',' value)* ','?)? close
//! ```
//!
//! 逻辑标记使用前缀（波兰）表示法：`['|', A, B]` 表示 `A OR B`。
//! 顶层剩余的项之间隐式为 AND。
//!
//! ## 解析示例
//!
//! ```text
//! [('active', '=', True)]
//! [('name', 'ilike', 'acme'), ('customer_rank', '>', 0)]
//! ['|', ('state', '=', 'draft'), ('state', '=', 'sent')]
//! [('state', 'in', ['purchase', 'done'])]
//! ```
//!
//! 解析器只从字面量 token 构造值，未知的裸词一律报错，不做解释。

use crate::ast::{Clause, FilterOp, FilterTerm, Literal, SimpleFilter};
use crate::token::{Span, Token, TokenKind};

pub struct Parser<'a> {
    tokens: &'a [Token<'a>],
    position: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    pub message: String,
    pub span: Option<Span>,
}

impl ParseError {
    fn new(message: String, span: Option<Span>) -> Self {
        Self { message, span }
    }

    fn at_position(message: String, span: Span) -> Self {
        Self {
            message,
            span: Some(span),
        }
    }
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.span {
            Some(span) => write!(f, "{} (at {}..{})", self.message, span.start, span.end),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for ParseError {}

/// 一步完成词法分析和语法分析
pub fn parse_filter(input: &str) -> Result<SimpleFilter, ParseError> {
    let tokens: Vec<_> = crate::lexer::Lexer::new(input).collect();
    Parser::new(&tokens).parse()
}

impl<'a> Parser<'a> {
    pub fn new(tokens: &'a [Token<'a>]) -> Self {
        Self {
            tokens,
            position: 0,
        }
    }

    /// 返回当前 token，不推进位置
    fn peek(&self) -> Option<&'a Token<'a>> {
        self.tokens.get(self.position)
    }

    /// 返回当前 token 并推进位置
    fn advance(&mut self) -> Option<&'a Token<'a>> {
        let token = self.tokens.get(self.position);
        if token.is_some() {
            self.position += 1;
        }
        token
    }

    /// 检查当前 token 是否匹配给定类型
    fn match_token(&self, kind: &TokenKind) -> bool {
        self.peek()
            .is_some_and(|token| std::mem::discriminant(&token.kind) == std::mem::discriminant(kind))
    }

    /// 期望特定类型的 token 并推进，否则返回错误
    fn expect(&mut self, expected: TokenKind) -> Result<Span, ParseError> {
        match self.peek() {
            Some(token) if std::mem::discriminant(&token.kind) == std::mem::discriminant(&expected) => {
                let span = token.span;
                self.position += 1;
                Ok(span)
            }
            Some(token) => Err(ParseError::at_position(
                format!("Expected {:?}, found {:?}", expected, token.kind),
                token.span,
            )),
            None => Err(ParseError::new(
                format!("Expected {:?}, but reached end of input", expected),
                None,
            )),
        }
    }

    pub fn parse(&mut self) -> Result<SimpleFilter, ParseError> {
        self.expect(TokenKind::LBracket)?;
        let mut terms = Vec::new();

        while !self.match_token(&TokenKind::RBracket) {
            terms.push(self.parse_term()?);
            if !self.consume_separator(&TokenKind::RBracket)? {
                break;
            }
        }
        self.expect(TokenKind::RBracket)?;

        if let Some(token) = self.peek() {
            return Err(ParseError::at_position(
                format!("Unexpected trailing token: {:?}", token.kind),
                token.span,
            ));
        }

        let filter = SimpleFilter::new(terms);
        filter
            .to_expr()
            .map_err(|e| ParseError::new(e.to_string(), None))?;
        Ok(filter)
    }

    /// 消费逗号；返回是否还可能有后续元素
    fn consume_separator(&mut self, close: &TokenKind) -> Result<bool, ParseError> {
        if self.match_token(&TokenKind::Comma) {
            self.advance();
            Ok(!self.match_token(close))
        } else if self.match_token(close) {
            Ok(false)
        } else {
            match self.peek() {
                Some(token) => Err(ParseError::at_position(
                    format!("Expected ',' or closing delimiter, found {:?}", token.kind),
                    token.span,
                )),
                None => Err(ParseError::new("Unexpected end of input".to_string(), None)),
            }
        }
    }

    fn parse_term(&mut self) -> Result<FilterTerm, ParseError> {
        let Some(token) = self.peek() else {
            return Err(ParseError::new("Unexpected end of input".to_string(), None));
        };
        match &token.kind {
            TokenKind::String(raw) => {
                let span = token.span;
                let marker = unescape(raw);
                self.advance();
                parse_marker(&marker).ok_or_else(|| {
                    ParseError::at_position(format!("Unknown logical marker '{}'", marker), span)
                })
            }
            TokenKind::LParen | TokenKind::LBracket => self.parse_clause().map(FilterTerm::Clause),
            other => Err(ParseError::at_position(
                format!("Expected clause or logical marker, found {:?}", other),
                token.span,
            )),
        }
    }

    fn parse_clause(&mut self) -> Result<Clause, ParseError> {
        let open_span = self.peek().map(|t| t.span).unwrap_or_default();
        let close = self.parse_open()?;

        let field = self.parse_string("field name")?;
        if field.trim().is_empty() {
            return Err(ParseError::at_position("Empty field name".to_string(), open_span));
        }
        self.expect(TokenKind::Comma)?;

        let op_span = self.peek().map(|t| t.span).unwrap_or_default();
        let op_text = self.parse_string("operator")?;
        let op = FilterOp::parse(&op_text).ok_or_else(|| {
            ParseError::at_position(format!("Unsupported operator '{}'", op_text), op_span)
        })?;
        self.expect(TokenKind::Comma)?;

        let value_span = self.peek().map(|t| t.span).unwrap_or_default();
        let value = self.parse_value()?;
        if self.match_token(&TokenKind::Comma) {
            self.advance();
        }
        self.expect(close)?;

        let is_list = matches!(value, Literal::List(_));
        if is_list != op.expects_list() {
            let message = if is_list {
                format!("Operator '{}' does not accept a list", op.as_str())
            } else {
                format!("Operator '{}' requires a list", op.as_str())
            };
            return Err(ParseError::at_position(message, value_span));
        }

        Ok(Clause {
            field: field.trim().to_string(),
            op,
            value,
        })
    }

    /// 消费开括号，返回与之对应的闭括号类型
    fn parse_open(&mut self) -> Result<TokenKind<'static>, ParseError> {
        match self.advance() {
            Some(Token { kind: TokenKind::LParen, .. }) => Ok(TokenKind::RParen),
            Some(Token { kind: TokenKind::LBracket, .. }) => Ok(TokenKind::RBracket),
            Some(token) => Err(ParseError::at_position(
                format!("Expected '(' or '[', found {:?}", token.kind),
                token.span,
            )),
            None => Err(ParseError::new("Unexpected end of input".to_string(), None)),
        }
    }

    fn parse_string(&mut self, what: &str) -> Result<String, ParseError> {
        match self.advance() {
            Some(Token { kind: TokenKind::String(raw), .. }) => Ok(unescape(raw)),
            Some(token) => Err(ParseError::at_position(
                format!("Expected quoted {}, found {:?}", what, token.kind),
                token.span,
            )),
            None => Err(ParseError::new(format!("Expected quoted {}", what), None)),
        }
    }

    fn parse_value(&mut self) -> Result<Literal, ParseError> {
        let Some(token) = self.peek() else {
            return Err(ParseError::new("Expected literal value".to_string(), None));
        };
        let literal = match &token.kind {
            TokenKind::LParen | TokenKind::LBracket => return self.parse_sequence(),
            TokenKind::String(raw) => Literal::String(unescape(raw)),
            TokenKind::Integer(n) => Literal::Integer(*n),
            TokenKind::Float(x) => Literal::Float(*x),
            TokenKind::True => Literal::Bool(true),
            TokenKind::False => Literal::Bool(false),
            TokenKind::None => Literal::Null,
            other => {
                return Err(ParseError::at_position(
                    format!("Expected literal value, found {:?}", other),
                    token.span,
                ))
            }
        };
        self.advance();
        Ok(literal)
    }

    fn parse_sequence(&mut self) -> Result<Literal, ParseError> {
        let close = self.parse_open()?;
        let mut items = Vec::new();
        while !self.match_token(&close) {
            items.push(self.parse_value()?);
            if !self.consume_separator(&close)? {
                break;
            }
        }
        self.expect(close)?;
        Ok(Literal::List(items))
    }
}

fn parse_marker(text: &str) -> Option<FilterTerm> {
    match text.trim().to_ascii_uppercase().as_str() {
        "&" | "AND" => Some(FilterTerm::And),
        "|" | "OR" => Some(FilterTerm::Or),
        "!" | "NOT" => Some(FilterTerm::Not),
        _ => None,
    }
}

/// 处理字符串中的转义序列
fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some(escaped @ ('\\' | '\'' | '"')) => out.push(escaped),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_filter() {
        let result = parse_filter("[('active', '=', True)]").unwrap();
        assert_eq!(
            result.terms,
            vec![FilterTerm::Clause(Clause::new("active", FilterOp::Eq, Literal::Bool(true)))]
        );
    }

    #[test]
    fn test_empty_list() {
        assert!(parse_filter("[]").unwrap().is_match_all());
    }

    #[test]
    fn test_multiple_clauses_with_double_quotes() {
        let result = parse_filter(r#"[("name", "ilike", "acme"), ("customer_rank", ">", 0)]"#).unwrap();
        let clauses: Vec<_> = result.clauses().collect();
        assert_eq!(clauses.len(), 2);
        assert_eq!(clauses[0].op, FilterOp::IContains);
        assert_eq!(clauses[1].value, Literal::Integer(0));
    }

    #[test]
    fn test_logical_markers() {
        let result = parse_filter("['|', ('state', '=', 'draft'), ('state', '=', 'sent')]").unwrap();
        assert_eq!(result.terms[0], FilterTerm::Or);
        assert_eq!(result.clauses().count(), 2);

        let words = parse_filter("['NOT', ('active', '=', True)]").unwrap();
        assert_eq!(words.terms[0], FilterTerm::Not);
    }

    #[test]
    fn test_marker_missing_operand_is_error() {
        let err = parse_filter("['&', ('active', '=', True)]").unwrap_err();
        assert!(err.message.contains("missing operands"));
    }

    #[test]
    fn test_in_clause_with_list_and_tuple() {
        let result = parse_filter("[('state', 'in', ['purchase', 'done'])]").unwrap();
        let clause = result.clauses().next().unwrap();
        assert_eq!(
            clause.value,
            Literal::List(vec![Literal::String("purchase".into()), Literal::String("done".into())])
        );

        let tuple = parse_filter("[('id', 'not in', (1, 2,))]").unwrap();
        let clause = tuple.clauses().next().unwrap();
        assert_eq!(clause.op, FilterOp::NotIn);
        assert_eq!(clause.value, Literal::List(vec![Literal::Integer(1), Literal::Integer(2)]));
    }

    #[test]
    fn test_in_requires_list() {
        assert!(parse_filter("[('state', 'in', 'done')]").is_err());
        assert!(parse_filter("[('state', '=', ['done'])]").is_err());
    }

    #[test]
    fn test_trailing_comma_is_accepted() {
        let result = parse_filter("[('active', '=', True),]").unwrap();
        assert_eq!(result.terms.len(), 1);
    }

    #[test]
    fn test_unknown_operator() {
        let err = parse_filter("[('name', '=like', 'a%')]").unwrap_err();
        assert!(err.message.contains("Unsupported operator"));
    }

    #[test]
    fn test_bare_word_rejected() {
        assert!(parse_filter("[('active', '=', yes)]").is_err());
        assert!(parse_filter("[(active, '=', True)]").is_err());
    }

    #[test]
    fn test_unterminated_string_rejected() {
        assert!(parse_filter("[('name', 'ilike', 'acme)]").is_err());
    }

    #[test]
    fn test_trailing_garbage_rejected() {
        let err = parse_filter("[('active', '=', True)] extra").unwrap_err();
        assert!(err.message.contains("trailing"));
    }

    #[test]
    fn test_escaped_quote_in_value() {
        let result = parse_filter(r"[('name', '=', 'O\'Brien')]").unwrap();
        assert_eq!(result.clauses().next().unwrap().value, Literal::String("O'Brien".into()));
    }
}
