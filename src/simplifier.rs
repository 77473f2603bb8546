//! Constant folding and dead-branch elimination.
//!
//! A post-order pass: by the time a node is handed to [`simplify`], its
//! children have already been simplified (the parser calls this on every
//! node as it is built, bottom-up). `simplify` additionally recurses, so
//! calling it again on an already-simplified tree is a no-op — simplifying
//! must be idempotent.

use crate::ast::{BinaryOp, ConstantView, LogicalOp, Node, UnaryOp};

pub fn simplify(node: Node) -> Node {
    match node {
        Node::Unary { op, operand, line } => simplify_unary(op, *operand, line),
        Node::Binary { op, left, right, line } => simplify_binary(op, *left, *right, line),
        Node::Logical { op, left, right, line } => simplify_logical(op, *left, *right, line),
        Node::If { cond, then_branch, else_branch, line } => {
            simplify_if(*cond, *then_branch, else_branch.map(|b| *b), line)
        }
        Node::While { cond, body, line } => simplify_while(*cond, *body, line),
        Node::For { init, cond, step, body, line } => simplify_for(init, cond, step, *body, line),
        other => other,
    }
}

fn simplify_unary(op: UnaryOp, operand: Node, line: u32) -> Node {
    // `not not x` -> `x`
    if op == UnaryOp::Not {
        if let Node::Unary { op: UnaryOp::Not, operand: inner, .. } = &operand {
            return (**inner).clone();
        }
        if let Some(b) = operand.is_truthy_constant() {
            return Node::Boolean { value: !b, line };
        }
    }
    if op == UnaryOp::Negate {
        // -(-x) -> x
        if let Node::Unary { op: UnaryOp::Negate, operand: inner, .. } = &operand {
            return (**inner).clone();
        }
        if let Some(ConstantView::Number(n)) = operand.as_constant() {
            return Node::Number { value: -n, line };
        }
    }
    Node::Unary { op, operand: Box::new(operand), line }
}

fn simplify_binary(op: BinaryOp, left: Node, right: Node, line: u32) -> Node {
    if let (Some(l), Some(r)) = (left.as_constant(), right.as_constant()) {
        if let Some(folded) = fold_binary(op, &l, &r, line) {
            return folded;
        }
    }
    Node::Binary { op, left: Box::new(left), right: Box::new(right), line }
}

fn fold_binary(op: BinaryOp, l: &ConstantView, r: &ConstantView, line: u32) -> Option<Node> {
    use ConstantView::*;
    match (op, l, r) {
        (BinaryOp::Add, Number(a), Number(b)) => Some(Node::Number { value: a + b, line }),
        (BinaryOp::Sub, Number(a), Number(b)) => Some(Node::Number { value: a - b, line }),
        (BinaryOp::Mul, Number(a), Number(b)) => Some(Node::Number { value: a * b, line }),
        (BinaryOp::Div, Number(a), Number(b)) if *b != 0.0 => {
            Some(Node::Number { value: a / b, line })
        }
        (BinaryOp::Add, String(a), String(b)) => {
            Some(Node::String { value: format!("{a}{b}"), line })
        }
        (BinaryOp::Mul, String(s), Number(n)) | (BinaryOp::Mul, Number(n), String(s))
            if is_nonnegative_integer(*n) =>
        {
            Some(Node::String { value: s.repeat(*n as usize), line })
        }
        (BinaryOp::Eq, _, _) => Some(Node::Boolean { value: constant_eq(l, r), line }),
        (BinaryOp::Neq, _, _) => Some(Node::Boolean { value: !constant_eq(l, r), line }),
        (BinaryOp::Lt, Number(a), Number(b)) => Some(Node::Boolean { value: a < b, line }),
        (BinaryOp::Le, Number(a), Number(b)) => Some(Node::Boolean { value: a <= b, line }),
        (BinaryOp::Gt, Number(a), Number(b)) => Some(Node::Boolean { value: a > b, line }),
        (BinaryOp::Ge, Number(a), Number(b)) => Some(Node::Boolean { value: a >= b, line }),
        (BinaryOp::Lt, String(a), String(b)) => Some(Node::Boolean { value: a < b, line }),
        (BinaryOp::Le, String(a), String(b)) => Some(Node::Boolean { value: a <= b, line }),
        (BinaryOp::Gt, String(a), String(b)) => Some(Node::Boolean { value: a > b, line }),
        (BinaryOp::Ge, String(a), String(b)) => Some(Node::Boolean { value: a >= b, line }),
        _ => None,
    }
}

fn is_nonnegative_integer(n: f64) -> bool {
    n.is_finite() && n >= 0.0 && n.trunc() == n
}

fn constant_eq(l: &ConstantView, r: &ConstantView) -> bool {
    use ConstantView::*;
    match (l, r) {
        (Nil, Nil) => true,
        (Boolean(a), Boolean(b)) => a == b,
        (Number(a), Number(b)) => a == b,
        (String(a), String(b)) => a == b,
        _ => false,
    }
}

fn simplify_logical(op: LogicalOp, left: Node, right: Node, line: u32) -> Node {
    if let (Some(a), Some(b)) = (left.is_truthy_constant(), right.is_truthy_constant()) {
        let value = match op {
            LogicalOp::And => a && b,
            LogicalOp::Or => a || b,
        };
        return Node::Boolean { value, line };
    }
    Node::Logical { op, left: Box::new(left), right: Box::new(right), line }
}

fn simplify_if(cond: Node, then_branch: Node, else_branch: Option<Node>, line: u32) -> Node {
    match cond.is_truthy_constant() {
        Some(true) => then_branch,
        Some(false) => else_branch.unwrap_or(Node::Block { statements: vec![], line }),
        None => Node::If {
            cond: Box::new(cond),
            then_branch: Box::new(then_branch),
            else_branch: else_branch.map(Box::new),
            line,
        },
    }
}

fn simplify_while(cond: Node, body: Node, line: u32) -> Node {
    if cond.is_truthy_constant() == Some(false) {
        return Node::Block { statements: vec![], line };
    }
    Node::While { cond: Box::new(cond), body: Box::new(body), line }
}

fn simplify_for(
    init: Option<Box<Node>>,
    cond: Option<Box<Node>>,
    step: Option<Box<Node>>,
    body: Node,
    line: u32,
) -> Node {
    if let Some(c) = &cond {
        if c.is_truthy_constant() == Some(false) {
            return Node::Block { statements: vec![], line };
        }
    }
    Node::For { init, cond, step, body: Box::new(body), line }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{BinaryOp, UnaryOp};

    fn num(v: f64) -> Node {
        Node::Number { value: v, line: 1 }
    }

    #[test]
    fn folds_arithmetic_left_to_right() {
        let expr = simplify(Node::Binary {
            op: BinaryOp::Mul,
            left: Box::new(num(2.0)),
            right: Box::new(num(3.0)),
            line: 1,
        });
        let expr = simplify(Node::Binary {
            op: BinaryOp::Add,
            left: Box::new(num(1.0)),
            right: Box::new(expr),
            line: 1,
        });
        assert!(matches!(expr, Node::Number { value, .. } if value == 7.0));
    }

    #[test]
    fn double_negation_cancels() {
        let expr = simplify(Node::Unary {
            op: UnaryOp::Not,
            operand: Box::new(Node::Unary {
                op: UnaryOp::Not,
                operand: Box::new(Node::Boolean { value: true, line: 1 }),
                line: 1,
            }),
            line: 1,
        });
        assert!(matches!(expr, Node::Boolean { value: true, .. }));
    }

    #[test]
    fn simplification_is_idempotent() {
        let once = simplify(Node::Binary {
            op: BinaryOp::Add,
            left: Box::new(num(1.0)),
            right: Box::new(num(2.0)),
            line: 1,
        });
        let twice = simplify(once.clone());
        match (once, twice) {
            (Node::Number { value: a, .. }, Node::Number { value: b, .. }) => assert_eq!(a, b),
            _ => panic!("expected folded numbers"),
        }
    }

    #[test]
    fn if_with_false_constant_collapses_to_else() {
        let node = simplify(Node::If {
            cond: Box::new(Node::Boolean { value: false, line: 1 }),
            then_branch: Box::new(Node::Block { statements: vec![num(1.0)], line: 1 }),
            else_branch: Some(Box::new(Node::Block { statements: vec![num(2.0)], line: 1 })),
            line: 1,
        });
        match node {
            Node::Block { statements, .. } => {
                assert!(matches!(statements[0], Node::Number { value, .. } if value == 2.0));
            }
            other => panic!("expected Block, got {other:?}"),
        }
    }
}
