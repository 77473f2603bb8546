//! Recursive-descent parser.

use crate::ast::{BinaryOp, LogicalOp, Node, UnaryOp};
use crate::errors::{IonError, Pos};
use crate::lexer::{Lexer, Token};
use crate::simplifier::simplify;
use std::collections::VecDeque;

pub struct Parser {
    tokens: VecDeque<(Token, Pos)>,
    source: String,
    loop_depth: u32,
    in_function: bool,
}

impl Parser {
    pub fn new(source: &str) -> Result<Self, IonError> {
        let tokens = Lexer::tokenize(source)?.into();
        Ok(Parser {
            tokens,
            source: source.to_string(),
            loop_depth: 0,
            in_function: false,
        })
    }

    /// Parses a full program: a block terminated by end-of-stream (spec
    /// §4.4 "Top level is a block that ends at end-of-stream").
    pub fn parse_program(&mut self) -> Result<Node, IonError> {
        let line = self.peek_pos().line;
        let mut statements = Vec::new();
        self.skip_separators();
        while !self.at(&Token::Eos) {
            statements.push(self.parse_statement()?);
            self.skip_separators();
        }
        Ok(Node::Block { statements, line })
    }

    // ------------------------------------------------------------------
    // token-stream helpers
    // ------------------------------------------------------------------

    fn peek(&self) -> &Token {
        &self.tokens.front().expect("Eos always terminates the stream").0
    }

    fn peek_pos(&self) -> Pos {
        self.tokens.front().expect("Eos always terminates the stream").1
    }

    fn at(&self, tok: &Token) -> bool {
        self.peek() == tok
    }

    fn bump(&mut self) -> Token {
        self.tokens.pop_front().expect("Eos always terminates the stream").0
    }

    fn expect(&mut self, tok: &Token) -> Result<(), IonError> {
        if self.at(tok) {
            self.bump();
            Ok(())
        } else {
            let pos = self.peek_pos();
            Err(IonError::syntax(pos, format!("{:?}", self.peek()), &self.source))
        }
    }

    fn skip_separators(&mut self) {
        while self.at(&Token::Newline) || self.at(&Token::Semicolon) {
            self.bump();
        }
    }

    fn syntax_error(&self, found: impl Into<String>) -> IonError {
        IonError::syntax(self.peek_pos(), found, &self.source)
    }

    fn semantic_error(&self, message: impl Into<String>) -> IonError {
        IonError::semantic(self.peek_pos(), message, &self.source)
    }

    // ------------------------------------------------------------------
    // statements
    // ------------------------------------------------------------------

    fn parse_statement(&mut self) -> Result<Node, IonError> {
        let line = self.peek_pos().line;
        match self.peek() {
            Token::If => self.parse_if(),
            Token::While => self.parse_while(),
            Token::For => self.parse_for(),
            Token::Def => self.parse_def(),
            Token::Return => {
                if !self.in_function {
                    return Err(self.semantic_error("'return' outside of a function"));
                }
                self.bump();
                let value = if self.at_statement_end() {
                    None
                } else {
                    Some(Box::new(self.parse_expr()?))
                };
                Ok(Node::Return { value, line })
            }
            Token::Break => {
                if self.loop_depth == 0 {
                    return Err(self.semantic_error("'break' outside of a loop"));
                }
                self.bump();
                Ok(Node::Break { line })
            }
            Token::Continue => {
                if self.loop_depth == 0 {
                    return Err(self.semantic_error("'continue' outside of a loop"));
                }
                self.bump();
                Ok(Node::Continue { line })
            }
            _ => {
                let expr = self.parse_expr()?;
                Ok(simplify(Node::ExprStmt { expr: Box::new(expr), line }))
            }
        }
    }

    fn at_statement_end(&self) -> bool {
        matches!(
            self.peek(),
            Token::Newline | Token::Semicolon | Token::End | Token::Else | Token::Eos
        )
    }

    /// A block of statements up to (not including) one of `terminators`.
    fn parse_block_until(&mut self, terminators: &[Token]) -> Result<Node, IonError> {
        let line = self.peek_pos().line;
        let mut statements = Vec::new();
        self.skip_separators();
        while !terminators.iter().any(|t| self.at(t)) && !self.at(&Token::Eos) {
            statements.push(self.parse_statement()?);
            self.skip_separators();
        }
        Ok(simplify(Node::Block { statements, line }))
    }

    fn parse_if(&mut self) -> Result<Node, IonError> {
        let line = self.peek_pos().line;
        self.bump(); // if
        let cond = self.parse_expr()?;
        let then_branch = self.parse_block_until(&[Token::Else, Token::End])?;
        let else_branch = if self.at(&Token::Else) {
            self.bump();
            Some(Box::new(self.parse_block_until(&[Token::End])?))
        } else {
            None
        };
        self.expect(&Token::End)?;
        Ok(simplify(Node::If {
            cond: Box::new(cond),
            then_branch: Box::new(then_branch),
            else_branch,
            line,
        }))
    }

    fn parse_while(&mut self) -> Result<Node, IonError> {
        let line = self.peek_pos().line;
        self.bump(); // while
        let cond = self.parse_expr()?;
        self.loop_depth += 1;
        let body = self.parse_block_until(&[Token::End]);
        self.loop_depth -= 1;
        let body = body?;
        self.expect(&Token::End)?;
        Ok(simplify(Node::While { cond: Box::new(cond), body: Box::new(body), line }))
    }

    fn parse_for(&mut self) -> Result<Node, IonError> {
        let line = self.peek_pos().line;
        self.bump(); // for
        let init = if self.at(&Token::Semicolon) {
            None
        } else {
            Some(Box::new(self.parse_expr()?))
        };
        self.expect(&Token::Semicolon)?;
        let cond = if self.at(&Token::Semicolon) {
            None
        } else {
            Some(Box::new(self.parse_expr()?))
        };
        self.expect(&Token::Semicolon)?;
        let step = if matches!(self.peek(), Token::Newline | Token::Eos) {
            None
        } else {
            Some(Box::new(self.parse_expr()?))
        };
        self.loop_depth += 1;
        let body = self.parse_block_until(&[Token::End]);
        self.loop_depth -= 1;
        let body = body?;
        self.expect(&Token::End)?;
        Ok(simplify(Node::For { init, cond, step, body: Box::new(body), line }))
    }

    fn parse_def(&mut self) -> Result<Node, IonError> {
        let line = self.peek_pos().line;
        self.bump(); // def
        let name = self.parse_identifier_name()?;
        self.expect(&Token::LParen)?;
        let mut params = Vec::new();
        if !self.at(&Token::RParen) {
            loop {
                params.push(self.parse_identifier_name()?);
                if self.at(&Token::Comma) {
                    self.bump();
                } else {
                    break;
                }
            }
        }
        self.expect(&Token::RParen)?;
        let was_in_function = std::mem::replace(&mut self.in_function, true);
        let saved_loop_depth = std::mem::replace(&mut self.loop_depth, 0);
        let body = self.parse_block_until(&[Token::End]);
        self.in_function = was_in_function;
        self.loop_depth = saved_loop_depth;
        let body = body?;
        self.expect(&Token::End)?;
        Ok(Node::FunctionDef { name, params, body: Box::new(body), line })
    }

    fn parse_identifier_name(&mut self) -> Result<String, IonError> {
        match self.bump() {
            Token::Identifier(name) => Ok(name),
            other => Err(self.syntax_error(format!("{other:?}"))),
        }
    }

    // ------------------------------------------------------------------
    // expressions (precedence, lowest to highest):
    // assignment, and, or, comparison, additive, multiplicative,
    // unary (not, -), postfix (index, call), primary.
    // ------------------------------------------------------------------

    pub fn parse_expr(&mut self) -> Result<Node, IonError> {
        self.parse_assignment()
    }

    fn parse_assignment(&mut self) -> Result<Node, IonError> {
        let line = self.peek_pos().line;
        let target = self.parse_and()?;

        let compound_op = match self.peek() {
            Token::Assign => None,
            Token::PlusAssign => Some(BinaryOp::Add),
            Token::MinusAssign => Some(BinaryOp::Sub),
            Token::StarAssign => Some(BinaryOp::Mul),
            Token::SlashAssign => Some(BinaryOp::Div),
            _ => return Ok(target),
        };
        let is_compound = compound_op.is_some();
        self.bump();
        self.ensure_assignable(&target)?;
        let value = self.parse_assignment()?;
        let value = if let Some(op) = compound_op {
            Node::Binary { op, left: Box::new(target.clone()), right: Box::new(value), line }
        } else {
            value
        };
        let _ = is_compound;
        Ok(simplify(Node::Assign { target: Box::new(target), value: Box::new(value), line }))
    }

    fn ensure_assignable(&self, target: &Node) -> Result<(), IonError> {
        match target {
            Node::Identifier { .. } | Node::Index { .. } => Ok(()),
            _ => Err(self.semantic_error("invalid assignment target")),
        }
    }

    fn parse_and(&mut self) -> Result<Node, IonError> {
        let mut left = self.parse_or()?;
        while self.at(&Token::And) {
            let line = self.peek_pos().line;
            self.bump();
            let right = self.parse_or()?;
            left = simplify(Node::Logical {
                op: LogicalOp::And,
                left: Box::new(left),
                right: Box::new(right),
                line,
            });
        }
        Ok(left)
    }

    fn parse_or(&mut self) -> Result<Node, IonError> {
        let mut left = self.parse_comparison()?;
        while self.at(&Token::Or) {
            let line = self.peek_pos().line;
            self.bump();
            let right = self.parse_comparison()?;
            left = simplify(Node::Logical {
                op: LogicalOp::Or,
                left: Box::new(left),
                right: Box::new(right),
                line,
            });
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<Node, IonError> {
        let mut left = self.parse_additive()?;
        loop {
            let op = match self.peek() {
                Token::Eq => BinaryOp::Eq,
                Token::Neq => BinaryOp::Neq,
                Token::Lt => BinaryOp::Lt,
                Token::Le => BinaryOp::Le,
                Token::Gt => BinaryOp::Gt,
                Token::Ge => BinaryOp::Ge,
                _ => break,
            };
            let line = self.peek_pos().line;
            self.bump();
            self.check_comparable_operand(&left)?;
            let right = self.parse_additive()?;
            self.check_comparable_operand(&right)?;
            self.check_comparison_consistency(&left, &right)?;
            left = simplify(Node::Binary { op, left: Box::new(left), right: Box::new(right), line });
        }
        Ok(left)
    }

    /// Rejects comparisons involving `nil` or a boolean constant at compile
    /// time.
    fn check_comparable_operand(&self, node: &Node) -> Result<(), IonError> {
        match node.as_constant() {
            Some(crate::ast::ConstantView::Nil) => {
                Err(self.semantic_error("cannot compare nil"))
            }
            Some(crate::ast::ConstantView::Boolean(_)) => {
                Err(self.semantic_error("cannot compare a boolean"))
            }
            _ => Ok(()),
        }
    }

    /// Rejects comparing a number constant against a string constant at
    /// compile time. Only fires when both sides are constants of differing
    /// kinds; a comparison against a variable is left to the VM's runtime
    /// type check, since its value isn't known yet.
    fn check_comparison_consistency(&self, left: &Node, right: &Node) -> Result<(), IonError> {
        use crate::ast::ConstantView;
        match (left.as_constant(), right.as_constant()) {
            (Some(ConstantView::Number(_)), Some(ConstantView::String(_)))
            | (Some(ConstantView::String(_)), Some(ConstantView::Number(_))) => {
                Err(self.semantic_error("cannot compare a number with a string"))
            }
            _ => Ok(()),
        }
    }

    fn parse_additive(&mut self) -> Result<Node, IonError> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Token::Plus => BinaryOp::Add,
                Token::Minus => BinaryOp::Sub,
                _ => break,
            };
            let line = self.peek_pos().line;
            self.bump();
            let right = self.parse_multiplicative()?;
            left = simplify(Node::Binary { op, left: Box::new(left), right: Box::new(right), line });
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Node, IonError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Token::Star => BinaryOp::Mul,
                Token::Slash => BinaryOp::Div,
                _ => break,
            };
            let line = self.peek_pos().line;
            self.bump();
            let right = self.parse_unary()?;
            left = simplify(Node::Binary { op, left: Box::new(left), right: Box::new(right), line });
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Node, IonError> {
        let line = self.peek_pos().line;
        match self.peek() {
            Token::Not => {
                self.bump();
                let operand = self.parse_unary()?;
                Ok(simplify(Node::Unary { op: UnaryOp::Not, operand: Box::new(operand), line }))
            }
            Token::Minus => {
                self.bump();
                let operand = self.parse_unary()?;
                Ok(simplify(Node::Unary { op: UnaryOp::Negate, operand: Box::new(operand), line }))
            }
            _ => self.parse_postfix(),
        }
    }

    fn parse_postfix(&mut self) -> Result<Node, IonError> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.peek() {
                Token::LBracket => {
                    let line = self.peek_pos().line;
                    self.bump();
                    let index = self.parse_expr()?;
                    self.expect(&Token::RBracket)?;
                    expr = Node::Index { container: Box::new(expr), index: Box::new(index), line };
                }
                Token::Dot => {
                    // a.m(args) rewrites to m(a, args) at parse time.
                    let line = self.peek_pos().line;
                    self.bump();
                    let method = self.parse_identifier_name()?;
                    self.expect(&Token::LParen)?;
                    let mut args = vec![expr];
                    args.extend(self.parse_call_args()?);
                    expr = Node::Call { callee: method, args, line };
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn parse_call_args(&mut self) -> Result<Vec<Node>, IonError> {
        let mut args = Vec::new();
        if !self.at(&Token::RParen) {
            loop {
                args.push(self.parse_expr()?);
                if self.at(&Token::Comma) {
                    self.bump();
                } else {
                    break;
                }
            }
        }
        self.expect(&Token::RParen)?;
        Ok(args)
    }

    fn parse_primary(&mut self) -> Result<Node, IonError> {
        let line = self.peek_pos().line;
        match self.bump() {
            Token::Nil => Ok(Node::Nil { line }),
            Token::True => Ok(Node::Boolean { value: true, line }),
            Token::False => Ok(Node::Boolean { value: false, line }),
            Token::Number(n) => Ok(Node::Number { value: n, line }),
            Token::String(s) => Ok(Node::String { value: s, line }),
            Token::New | Token::To => {
                Err(self.semantic_error("'new'/'to' are reserved and not yet implemented"))
            }
            Token::Identifier(name) => {
                if self.at(&Token::LParen) {
                    self.bump();
                    let args = self.parse_call_args()?;
                    Ok(Node::Call { callee: name, args, line })
                } else {
                    Ok(Node::Identifier { name, line })
                }
            }
            Token::LParen => {
                let inner = self.parse_expr()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Token::LBracket => {
                let mut items = Vec::new();
                if !self.at(&Token::RBracket) {
                    loop {
                        items.push(self.parse_expr()?);
                        if self.at(&Token::Comma) {
                            self.bump();
                        } else {
                            break;
                        }
                    }
                }
                self.expect(&Token::RBracket)?;
                Ok(Node::List { items, line })
            }
            Token::LBrace => {
                let mut entries = Vec::new();
                if !self.at(&Token::RBrace) {
                    loop {
                        let key = self.parse_expr()?;
                        self.expect(&Token::Colon)?;
                        let value = self.parse_expr()?;
                        entries.push((key, value));
                        if self.at(&Token::Comma) {
                            self.bump();
                        } else {
                            break;
                        }
                    }
                }
                self.expect(&Token::RBrace)?;
                Ok(Node::Dictionary { entries, line })
            }
            other => Err(self.syntax_error(format!("{other:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(src: &str) -> Node {
        Parser::new(src).unwrap().parse_program().unwrap()
    }

    #[test]
    fn break_outside_loop_is_semantic_error() {
        assert!(Parser::new("break").unwrap().parse_program().is_err());
    }

    #[test]
    fn return_outside_function_is_semantic_error() {
        assert!(Parser::new("return 1").unwrap().parse_program().is_err());
    }

    #[test]
    fn method_call_rewrites_to_implicit_self_call() {
        let node = parse("a.m(1)");
        match &node {
            Node::Block { statements, .. } => match &statements[0] {
                Node::ExprStmt { expr, .. } => match expr.as_ref() {
                    Node::Call { callee, args, .. } => {
                        assert_eq!(callee, "m");
                        assert_eq!(args.len(), 2);
                    }
                    other => panic!("expected Call, got {other:?}"),
                },
                other => panic!("expected ExprStmt, got {other:?}"),
            },
            other => panic!("expected Block, got {other:?}"),
        }
    }

    #[test]
    fn constant_folding_happens_during_parse() {
        let node = parse("1 + 2 * 3");
        match &node {
            Node::Block { statements, .. } => match &statements[0] {
                Node::ExprStmt { expr, .. } => {
                    assert!(matches!(expr.as_ref(), Node::Number { value, .. } if *value == 7.0));
                }
                other => panic!("expected ExprStmt, got {other:?}"),
            },
            other => panic!("expected Block, got {other:?}"),
        }
    }
}
