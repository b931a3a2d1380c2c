// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Safe arithmetic evaluation without shelling out to an interpreter.
//!
//! Supports `+ - * / ^`, parentheses, unary minus, and decimal literals.
//! `^` is exponentiation and binds right-associatively.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::tool::{Tool, ToolResult};

pub struct CalculatorTool;

#[async_trait]
impl Tool for CalculatorTool {
    fn name(&self) -> &str {
        "calculator"
    }

    fn description(&self) -> &str {
        "Perform a mathematical calculation safely."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "expression": {
                    "type": "string",
                    "description": "The math expression to evaluate (e.g., '2 + 2 * 3')."
                }
            },
            "required": ["expression"]
        })
    }

    async fn execute(&self, args: Value) -> anyhow::Result<ToolResult> {
        let Some(expression) = args["expression"].as_str() else {
            return Ok(ToolResult::err(
                "calculator requires an 'expression' string argument",
            ));
        };
        if !expression
            .chars()
            .all(|c| c.is_ascii_digit() || "+-*/^(). \t".contains(c))
        {
            return Ok(ToolResult::err("expression contains invalid characters"));
        }
        match eval(expression) {
            Ok(v) => Ok(ToolResult::ok(format_number(v))),
            Err(e) => Ok(ToolResult::err(format!("evaluating expression: {e}"))),
        }
    }
}

fn format_number(v: f64) -> String {
    if v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        format!("{v}")
    }
}

fn eval(expr: &str) -> Result<f64, String> {
    let mut p = Parser {
        chars: expr.chars().filter(|c| !c.is_whitespace()).collect(),
        pos: 0,
    };
    let v = p.expr()?;
    if p.pos != p.chars.len() {
        return Err(format!("unexpected character '{}'", p.chars[p.pos]));
    }
    Ok(v)
}

struct Parser {
    chars: Vec<char>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    // expr := term (('+' | '-') term)*
    fn expr(&mut self) -> Result<f64, String> {
        let mut acc = self.term()?;
        while let Some(op) = self.peek() {
            match op {
                '+' => {
                    self.bump();
                    acc += self.term()?;
                }
                '-' => {
                    self.bump();
                    acc -= self.term()?;
                }
                _ => break,
            }
        }
        Ok(acc)
    }

    // term := power (('*' | '/') power)*
    fn term(&mut self) -> Result<f64, String> {
        let mut acc = self.power()?;
        while let Some(op) = self.peek() {
            match op {
                '*' => {
                    self.bump();
                    acc *= self.power()?;
                }
                '/' => {
                    self.bump();
                    let rhs = self.power()?;
                    if rhs == 0.0 {
                        return Err("division by zero".into());
                    }
                    acc /= rhs;
                }
                _ => break,
            }
        }
        Ok(acc)
    }

    // power := unary ('^' power)?   (right-associative)
    fn power(&mut self) -> Result<f64, String> {
        let base = self.unary()?;
        if self.peek() == Some('^') {
            self.bump();
            let exp = self.power()?;
            return Ok(base.powf(exp));
        }
        Ok(base)
    }

    // unary := '-' unary | atom
    fn unary(&mut self) -> Result<f64, String> {
        if self.peek() == Some('-') {
            self.bump();
            return Ok(-self.unary()?);
        }
        self.atom()
    }

    // atom := number | '(' expr ')'
    fn atom(&mut self) -> Result<f64, String> {
        match self.peek() {
            Some('(') => {
                self.bump();
                let v = self.expr()?;
                if self.bump() != Some(')') {
                    return Err("missing closing parenthesis".into());
                }
                Ok(v)
            }
            Some(c) if c.is_ascii_digit() || c == '.' => {
                let start = self.pos;
                while matches!(self.peek(), Some(c) if c.is_ascii_digit() || c == '.') {
                    self.bump();
                }
                let text: String = self.chars[start..self.pos].iter().collect();
                text.parse::<f64>().map_err(|_| format!("bad number '{text}'"))
            }
            Some(c) => Err(format!("unexpected character '{c}'")),
            None => Err("unexpected end of expression".into()),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
