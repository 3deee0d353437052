use super::lexer::Token;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallArg {
    /// Integer literal, passed through verbatim.
    Literal(String),
    /// Argument name or `$n` reference.
    Reference(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallExpr {
    pub name: String,
    pub args: Vec<CallArg>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Node(i64),
    Arg(String),
    Any,
    All,
    AllCoalesce,
    Hash(CallExpr),
}

/// `cluster <name>; run [<call>] on <target>;`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    pub cluster: String,
    pub run: Option<CallExpr>,
    pub target: Target,
}

pub fn parse(toks: &[Token]) -> Result<Statement, String> {
    let mut p = Parser { toks, i: 0 };
    let cluster = p.parse_cluster()?;
    let run = p.parse_run()?;
    let target = p.parse_target()?;
    if let Some(tok) = p.peek() {
        return Err(format!("unexpected token '{tok}' after run statement"));
    }
    Ok(Statement {
        cluster,
        run,
        target,
    })
}

struct Parser<'a> {
    toks: &'a [Token],
    i: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.toks.get(self.i)
    }

    fn position(&self, tok: &Token) -> Option<usize> {
        self.toks[self.i..]
            .iter()
            .position(|t| t == tok)
            .map(|p| p + self.i)
    }

    fn expect_symbol(&mut self, symbol: char, err: &str) -> Result<(), String> {
        match self.peek() {
            Some(Token::Symbol(c)) if *c == symbol => {
                self.i += 1;
                Ok(())
            }
            _ => Err(err.to_string()),
        }
    }

    fn parse_cluster(&mut self) -> Result<String, String> {
        if self.peek() != Some(&Token::Cluster) {
            return Err("'cluster' keyword not found".to_string());
        }
        if self.toks.get(2) != Some(&Token::Symbol(';')) {
            return Err("no ';' at the end of cluster statement".to_string());
        }
        let name = match &self.toks[1] {
            Token::Ident(name) => name.clone(),
            _ => return Err("cluster name is not valid identifier".to_string()),
        };
        self.i = 3;
        Ok(name)
    }

    fn parse_run(&mut self) -> Result<Option<CallExpr>, String> {
        match self.peek() {
            Some(Token::Run) => self.i += 1,
            _ => return Err("'run' keyword not found".to_string()),
        }
        let on = self
            .position(&Token::On)
            .ok_or_else(|| "'on' keyword not found".to_string())?;

        let call = match self.peek() {
            Some(Token::FuncName(_)) => Some(self.parse_call()?),
            _ => None,
        };
        if self.i != on {
            return Err("invalid symbols between 'run' and 'on'".to_string());
        }
        self.i += 1;
        Ok(call)
    }

    fn parse_call(&mut self) -> Result<CallExpr, String> {
        let name = match self.peek() {
            Some(Token::FuncName(name)) => name.clone(),
            other => return Err(format!("expected function name, got {other:?}")),
        };
        self.i += 1;
        self.expect_symbol('(', &format!("')' missed for function '{name}'"))?;

        let close = self
            .position(&Token::Symbol(')'))
            .ok_or_else(|| format!("')' missed for function '{name}'"))?;
        let inner = &self.toks[self.i..close];

        let mut args = Vec::new();
        let mut expect_arg = true;
        for tok in inner {
            if expect_arg {
                let arg = match tok {
                    Token::Number(n) => CallArg::Literal(n.clone()),
                    Token::Ident(s) | Token::Param(s) => CallArg::Reference(s.clone()),
                    other => return Err(format!("function '{name}' call corrupted at '{other}'")),
                };
                args.push(arg);
            } else if *tok != Token::Symbol(',') {
                return Err(format!("function '{name}' call corrupted at '{tok}'"));
            }
            expect_arg = !expect_arg;
        }
        if !inner.is_empty() && expect_arg {
            return Err(format!("function '{name}' argument missed"));
        }

        self.i = close + 1;
        Ok(CallExpr { name, args })
    }

    fn parse_target(&mut self) -> Result<Target, String> {
        let target = match self.peek() {
            None => return Err("hash statement not closed by ';'".to_string()),
            Some(Token::Symbol(';')) => return Err("hash statement missed".to_string()),
            Some(Token::Number(n)) => {
                let node = n
                    .parse::<i64>()
                    .map_err(|_| format!("node number '{n}' is not valid"))?;
                self.i += 1;
                Target::Node(node)
            }
            Some(Token::Ident(name)) => {
                let name = name.clone();
                self.i += 1;
                Target::Arg(name)
            }
            Some(Token::Any) => {
                self.i += 1;
                Target::Any
            }
            Some(Token::All) => {
                self.i += 1;
                Target::All
            }
            Some(Token::AllCoalesce) => {
                self.i += 1;
                Target::AllCoalesce
            }
            Some(Token::FuncName(_)) => Target::Hash(self.parse_call()?),
            Some(other) => return Err(format!("unexpected token '{other}' after 'on'")),
        };
        self.expect_symbol(';', "hash statement not closed by ';'")?;
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::lexer::tokenize;

    fn parse_str(body: &str) -> Result<Statement, String> {
        parse(&tokenize(body)?)
    }

    #[test]
    fn parses_fixed_node() {
        let stmt = parse_str("cluster users; run on 2;").unwrap();
        assert_eq!(stmt.cluster, "users");
        assert_eq!(stmt.run, None);
        assert_eq!(stmt.target, Target::Node(2));
    }

    #[test]
    fn parses_run_call_and_hash_target() {
        let stmt = parse_str("cluster c; run get(uid, 5) on hash(uid);").unwrap();
        assert_eq!(
            stmt.run,
            Some(CallExpr {
                name: "get".into(),
                args: vec![
                    CallArg::Reference("uid".into()),
                    CallArg::Literal("5".into())
                ],
            })
        );
        assert_eq!(
            stmt.target,
            Target::Hash(CallExpr {
                name: "hash".into(),
                args: vec![CallArg::Reference("uid".into())],
            })
        );
    }

    #[test]
    fn parses_policy_keywords() {
        assert_eq!(parse_str("cluster c; run on any;").unwrap().target, Target::Any);
        assert_eq!(parse_str("cluster c; run on all;").unwrap().target, Target::All);
        assert_eq!(
            parse_str("cluster c; run on all coalesce;").unwrap().target,
            Target::AllCoalesce
        );
        assert_eq!(
            parse_str("cluster c; run on shard;").unwrap().target,
            Target::Arg("shard".into())
        );
    }

    #[test]
    fn empty_call_has_no_args() {
        let stmt = parse_str("cluster c; run on pick();").unwrap();
        assert_eq!(
            stmt.target,
            Target::Hash(CallExpr {
                name: "pick".into(),
                args: vec![],
            })
        );
    }

    #[test]
    fn cluster_statement_errors() {
        assert_eq!(parse_str("run on 0;").unwrap_err(), "'cluster' keyword not found");
        assert_eq!(
            parse_str("cluster c run on 0;").unwrap_err(),
            "no ';' at the end of cluster statement"
        );
        assert_eq!(
            parse_str("cluster 12; run on 0;").unwrap_err(),
            "cluster name is not valid identifier"
        );
    }

    #[test]
    fn run_statement_errors() {
        assert_eq!(parse_str("cluster c; on 0;").unwrap_err(), "'run' keyword not found");
        assert_eq!(parse_str("cluster c; run 0;").unwrap_err(), "'on' keyword not found");
        assert_eq!(
            parse_str("cluster c; run x on 0;").unwrap_err(),
            "invalid symbols between 'run' and 'on'"
        );
        assert_eq!(
            parse_str("cluster c; run f(a) b on 0;").unwrap_err(),
            "invalid symbols between 'run' and 'on'"
        );
    }

    #[test]
    fn call_errors() {
        assert_eq!(
            parse_str("cluster c; run f(a on 0;").unwrap_err(),
            "')' missed for function 'f'"
        );
        assert_eq!(
            parse_str("cluster c; run f(a b) on 0;").unwrap_err(),
            "function 'f' call corrupted at 'b'"
        );
        assert_eq!(
            parse_str("cluster c; run f(,a) on 0;").unwrap_err(),
            "function 'f' call corrupted at ','"
        );
        assert_eq!(
            parse_str("cluster c; run f(a,) on 0;").unwrap_err(),
            "function 'f' argument missed"
        );
    }

    #[test]
    fn target_errors() {
        assert_eq!(
            parse_str("cluster c; run on 0").unwrap_err(),
            "hash statement not closed by ';'"
        );
        assert_eq!(parse_str("cluster c; run on;").unwrap_err(), "hash statement missed");
        assert_eq!(parse_str("cluster c; run on").unwrap_err(), "hash statement not closed by ';'");
        assert_eq!(
            parse_str("cluster c; run on run;").unwrap_err(),
            "unexpected token 'run' after 'on'"
        );
        assert_eq!(
            parse_str("cluster c; run on 1 2;").unwrap_err(),
            "hash statement not closed by ';'"
        );
        assert_eq!(
            parse_str("cluster c; run on 1; run").unwrap_err(),
            "unexpected token 'run' after run statement"
        );
    }
}
