use std::str::FromStr;

use serde_json::Value;

use crate::lexer::Lexer;
use crate::Error;

#[derive(Debug, PartialEq)]
pub enum Operator {
    // Logical
    And,
    Or,

    // Numbers
    LessThan,
    LessEqual,
    Equal,
    NotEqual,
    GreaterEqual,
    GreaterThan,

    // String
    Contains,
    Match,
}

impl TryFrom<(usize, &str)> for Operator {
    type Error = Error;

    fn try_from(value: (usize, &str)) -> Result<Self, Self::Error> {
        let pos = value.0;
        let value = value.1;

        match value {
            "and" | "&&" => Ok(Operator::And),
            "or" | "||" => Ok(Operator::Or),

            "lt" | "<" => Ok(Operator::LessThan),
            "le" | "<=" => Ok(Operator::LessEqual),
            "eq" | "==" => Ok(Operator::Equal),
            "ne" | "!=" => Ok(Operator::NotEqual),
            "ge" | ">=" => Ok(Operator::GreaterEqual),
            "gt" | ">" => Ok(Operator::GreaterThan),

            "contains" => Ok(Operator::Contains),
            "match" => Ok(Operator::Match),

            _ => Err(Error::UnknownOperator {
                pos,
                found: value.into(),
            }),
        }
    }
}

#[derive(Debug)]
pub enum Expression {
    Float(f64),
    String(String),
    Path(Vec<String>),
    Regex(regex::Regex),

    Binary {
        op: Operator,
        lhs: Box<Expression>,
        rhs: Box<Expression>,
    },
}

impl PartialEq for Expression {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Expression::Float(a), Expression::Float(b)) => a.eq(b),
            (Expression::String(a), Expression::String(b)) => a.eq(b),
            (Expression::Path(a), Expression::Path(b)) => a.eq(b),
            (Expression::Regex(a), Expression::Regex(b)) => a.as_str().eq(b.as_str()),
            (
                Expression::Binary {
                    lhs: al,
                    op: ao,
                    rhs: ar,
                },
                Expression::Binary {
                    lhs: bl,
                    op: bo,
                    rhs: br,
                },
            ) => al.eq(bl) && ao.eq(bo) && ar.eq(br),
            _ => false,
        }
    }
}

fn resolve<'a>(input: &'a Value, path: &[String]) -> Option<&'a Value> {
    let mut current = input;

    for segment in path {
        match current {
            Value::Object(map) => current = map.get(segment)?,
            Value::Array(items) => {
                let index = segment.parse::<usize>().ok()?;
                current = items.get(index)?;
            }
            _ => return None,
        }
    }

    Some(current)
}

fn as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

impl Expression {
    fn boxed(self) -> Box<Self> {
        Box::new(self)
    }

    /// Evaluate against a JSON representation of an event.
    ///
    /// Comparisons against missing fields or mismatched types yield `false`
    /// instead of an error, the way a jq filter yields null-compares-false.
    pub fn eval(&self, input: &Value) -> bool {
        match self {
            Expression::Binary { op, lhs, rhs } => match op {
                Operator::And => lhs.eval(input) && rhs.eval(input),
                Operator::Or => lhs.eval(input) || rhs.eval(input),
                Operator::Contains => match (lhs.string(input), rhs.string(input)) {
                    (Some(l), Some(r)) => l.contains(&r),
                    _ => false,
                },
                Operator::Match => match (lhs.string(input), rhs.as_ref()) {
                    (Some(l), Expression::Regex(re)) => re.is_match(&l),
                    _ => false,
                },
                op => {
                    if let (Some(l), Some(r)) = (lhs.number(input), rhs.number(input)) {
                        return match op {
                            Operator::LessThan => l < r,
                            Operator::LessEqual => l <= r,
                            Operator::Equal => l == r,
                            Operator::NotEqual => l != r,
                            Operator::GreaterEqual => l >= r,
                            Operator::GreaterThan => l > r,
                            _ => unreachable!(),
                        };
                    }

                    match (lhs.string(input), rhs.string(input)) {
                        (Some(l), Some(r)) => match op {
                            Operator::Equal => l == r,
                            Operator::NotEqual => l != r,
                            Operator::LessThan => l < r,
                            Operator::LessEqual => l <= r,
                            Operator::GreaterEqual => l >= r,
                            Operator::GreaterThan => l > r,
                            _ => unreachable!(),
                        },
                        _ => false,
                    }
                }
            },

            // a bare term is truthy the way jq treats it
            Expression::Path(path) => match resolve(input, path) {
                Some(Value::Bool(b)) => *b,
                Some(Value::Null) | None => false,
                Some(_) => true,
            },
            Expression::Float(f) => *f != 0.0,
            Expression::String(s) => !s.is_empty(),
            Expression::Regex(_) => false,
        }
    }

    fn number(&self, input: &Value) -> Option<f64> {
        match self {
            Expression::Float(f) => Some(*f),
            Expression::Path(path) => resolve(input, path)?.as_f64(),
            _ => None,
        }
    }

    fn string(&self, input: &Value) -> Option<String> {
        match self {
            Expression::String(s) => Some(s.clone()),
            Expression::Float(f) => Some(f.to_string()),
            Expression::Path(path) => as_string(resolve(input, path)?),
            _ => None,
        }
    }
}

pub(crate) struct Parser<'a> {
    lexer: std::iter::Peekable<Lexer<'a>>,
}

impl<'a> Parser<'a> {
    pub fn new(input: &'a str) -> Self {
        Self {
            lexer: Lexer::new(input).peekable(),
        }
    }

    fn primary(&mut self) -> Result<Expression, Error> {
        let (pos, token) = self.lexer.next().ok_or(Error::EarlyEof)?;

        if let Some(path) = token.strip_prefix('.') {
            if path.is_empty() {
                return Err(Error::PathExpected { pos });
            }

            Ok(Expression::Path(
                path.split('.').map(str::to_string).collect(),
            ))
        } else if token == "(" {
            let node = self.expr()?;
            match self.lexer.next() {
                Some((_, ")")) => Ok(node),
                Some((pos, found)) => Err(Error::ExpectClosing {
                    pos,
                    found: found.into(),
                }),
                None => Err(Error::EarlyEof),
            }
        } else if let Some(quoted) = token.strip_prefix('"') {
            Ok(Expression::String(
                quoted.strip_suffix('"').unwrap_or(quoted).to_string(),
            ))
        } else if let Ok(f) = token.parse::<f64>() {
            Ok(Expression::Float(f))
        } else {
            Ok(Expression::String(token.into()))
        }
    }

    /// A single comparison, or a bare term.
    fn term(&mut self) -> Result<Expression, Error> {
        let lhs = self.primary()?;

        let op: Operator = match self.lexer.peek() {
            Some((_, token)) if !matches!(*token, ")" | "and" | "&&" | "or" | "||") => {
                let next = self.lexer.next().expect("peeked");
                next.try_into()?
            }
            _ => return Ok(lhs),
        };

        let rhs = self.primary()?;

        // `match` compiles its pattern once, here
        let rhs = if op == Operator::Match {
            match rhs {
                Expression::String(pattern) => {
                    let re = regex::Regex::new(&pattern)
                        .map_err(|err| Error::InvalidRegex { pattern, err })?;
                    Expression::Regex(re)
                }
                other => other,
            }
        } else {
            rhs
        };

        Ok(Expression::Binary {
            op,
            lhs: lhs.boxed(),
            rhs: rhs.boxed(),
        })
    }

    fn conjunction(&mut self) -> Result<Expression, Error> {
        let mut node = self.term()?;

        while let Some((_, token)) = self.lexer.peek() {
            if !matches!(*token, "and" | "&&") {
                break;
            }

            self.lexer.next();
            let rhs = self.term()?;

            node = Expression::Binary {
                op: Operator::And,
                lhs: node.boxed(),
                rhs: rhs.boxed(),
            };
        }

        Ok(node)
    }

    fn expr(&mut self) -> Result<Expression, Error> {
        let mut node = self.conjunction()?;

        while let Some((_, token)) = self.lexer.peek() {
            if !matches!(*token, "or" | "||") {
                break;
            }

            self.lexer.next();
            let rhs = self.conjunction()?;

            node = Expression::Binary {
                op: Operator::Or,
                lhs: node.boxed(),
                rhs: rhs.boxed(),
            };
        }

        Ok(node)
    }

    pub fn parse(&mut self) -> Result<Expression, Error> {
        let node = self.expr()?;

        match self.lexer.next() {
            None => Ok(node),
            Some((pos, found)) => Err(Error::UnexpectedToken {
                pos,
                found: found.into(),
            }),
        }
    }
}

impl FromStr for Expression {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Parser::new(s).parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse() {
        let tests = [
            (
                ".foo lt 10.1",
                Expression::Binary {
                    lhs: Expression::Path(vec!["foo".into()]).boxed(),
                    op: Operator::LessThan,
                    rhs: Expression::Float(10.1).boxed(),
                },
            ),
            (
                ".foo lt 10 and .bar gt 2",
                Expression::Binary {
                    lhs: Expression::Binary {
                        lhs: Expression::Path(vec!["foo".into()]).boxed(),
                        op: Operator::LessThan,
                        rhs: Expression::Float(10.0).boxed(),
                    }
                    .boxed(),
                    op: Operator::And,
                    rhs: Expression::Binary {
                        lhs: Expression::Path(vec!["bar".into()]).boxed(),
                        op: Operator::GreaterThan,
                        rhs: Expression::Float(2.0).boxed(),
                    }
                    .boxed(),
                },
            ),
            (
                ".message contains info and (.upper gt 10 or .lower lt -1)",
                Expression::Binary {
                    op: Operator::And,
                    lhs: Expression::Binary {
                        op: Operator::Contains,
                        lhs: Expression::Path(vec!["message".into()]).boxed(),
                        rhs: Expression::String("info".into()).boxed(),
                    }
                    .boxed(),
                    rhs: Expression::Binary {
                        op: Operator::Or,
                        lhs: Expression::Binary {
                            op: Operator::GreaterThan,
                            lhs: Expression::Path(vec!["upper".into()]).boxed(),
                            rhs: Expression::Float(10.0).boxed(),
                        }
                        .boxed(),
                        rhs: Expression::Binary {
                            op: Operator::LessThan,
                            lhs: Expression::Path(vec!["lower".into()]).boxed(),
                            rhs: Expression::Float(-1.0).boxed(),
                        }
                        .boxed(),
                    }
                    .boxed(),
                },
            ),
        ];

        for (input, want) in tests {
            let got = Parser::new(input).parse().unwrap();
            assert_eq!(
                got, want,
                "input: {}\nwant: {:?}\ngot:  {:?}",
                input, want, got
            )
        }
    }

    #[test]
    fn parse_errors() {
        for input in ["", ".foo lt", "( .foo eq 1", ". eq 2", ".foo eq 1 )"] {
            assert!(
                Parser::new(input).parse().is_err(),
                "input {:?} should not parse",
                input
            );
        }

        // invalid regex is a parse error, not an eval error
        assert!(matches!(
            Parser::new(r#".name match "[""#).parse(),
            Err(Error::InvalidRegex { .. })
        ));
    }

    #[test]
    fn eval() {
        let input = json!({
            "name": "port-stats",
            "timestamp": 1_700_000_000_000_000_000u64,
            "tags": {
                "interface": "ethernet1/1",
                "source": "leaf1:57400",
            },
            "values": {
                "in-octets": 1024,
                "oper-state": "up",
            },
        });

        let tests = [
            (".tags.interface contains ethernet", true),
            (r#".tags.interface eq "ethernet1/1""#, true),
            (".tags.interface eq ethernet1/9", false),
            (".values.in-octets gt 1000", true),
            (".values.in-octets gt 2000", false),
            (
                ".values.in-octets ge 1024 and .values.oper-state eq up",
                true,
            ),
            (
                ".values.oper-state eq down or .tags.source contains leaf",
                true,
            ),
            (".values.missing gt 1", false),
            (".tags.interface match ethernet[0-9]+/[0-9]+", true),
            (".tags.interface match ^Ethernet", false),
            (".name contains stats", true),
        ];

        for (expr, want) in tests {
            let compiled: Expression = expr.parse().unwrap();
            assert_eq!(compiled.eval(&input), want, "expr: {}", expr);
        }
    }

    #[test]
    fn or_binds_looser_than_and() {
        // a or (b and c), not (a or b) and c
        let compiled: Expression = ".a eq 1 or .b eq 1 and .c eq 1".parse().unwrap();

        assert!(compiled.eval(&json!({"a": 1, "b": 0, "c": 0})));
        assert!(!compiled.eval(&json!({"a": 0, "b": 1, "c": 0})));
        assert!(compiled.eval(&json!({"a": 0, "b": 1, "c": 1})));
    }
}
