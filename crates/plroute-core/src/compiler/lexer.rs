use std::fmt;

/// Raw lexemes from the scanning pass.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Lexeme {
    Word(String),
    Param(String),
    Symbol(char),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Cluster,
    Run,
    On,
    Any,
    All,
    AllCoalesce,
    Ident(String),
    /// An identifier directly followed by `(`.
    FuncName(String),
    Number(String),
    Param(String),
    Symbol(char),
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Cluster => f.write_str("cluster"),
            Token::Run => f.write_str("run"),
            Token::On => f.write_str("on"),
            Token::Any => f.write_str("any"),
            Token::All => f.write_str("all"),
            Token::AllCoalesce => f.write_str("all coalesce"),
            Token::Ident(s) | Token::FuncName(s) | Token::Number(s) | Token::Param(s) => {
                f.write_str(s)
            }
            Token::Symbol(c) => write!(f, "{c}"),
        }
    }
}

/// Splits a routing body into classified tokens.
pub fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    Ok(classify(scan(input)?))
}

fn scan(input: &str) -> Result<Vec<Lexeme>, String> {
    let mut out = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0usize;

    while i < chars.len() {
        let c = chars[i];
        if matches!(c, ' ' | '\t' | '\r' | '\n') {
            i += 1;
            continue;
        }
        if "(),;".contains(c) {
            out.push(Lexeme::Symbol(c));
            i += 1;
            continue;
        }
        if c == '$' && chars.get(i + 1).is_some_and(|d| d.is_ascii_digit()) {
            let start = i;
            i += 1;
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
            out.push(Lexeme::Param(chars[start..i].iter().collect()));
            continue;
        }
        if c.is_ascii_alphanumeric() || c == '_' {
            let start = i;
            i += 1;
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            out.push(Lexeme::Word(chars[start..i].iter().collect()));
            continue;
        }

        return Err(format!("unexpected symbol '{c}'"));
    }

    Ok(out)
}

fn keyword(word: &str) -> Option<Token> {
    let kw = match word.to_ascii_lowercase().as_str() {
        "cluster" => Token::Cluster,
        "run" => Token::Run,
        "on" => Token::On,
        "any" => Token::Any,
        "all" => Token::All,
        _ => return None,
    };
    Some(kw)
}

fn classify(lexemes: Vec<Lexeme>) -> Vec<Token> {
    let mut out = Vec::with_capacity(lexemes.len());
    let mut iter = lexemes.into_iter().peekable();

    while let Some(lexeme) = iter.next() {
        let token = match lexeme {
            Lexeme::Symbol(c) => Token::Symbol(c),
            Lexeme::Param(p) => Token::Param(p),
            Lexeme::Word(w) => match keyword(&w) {
                Some(Token::All) => {
                    let merges = matches!(
                        iter.peek(),
                        Some(Lexeme::Word(next)) if next.eq_ignore_ascii_case("coalesce")
                    );
                    if merges {
                        iter.next();
                        Token::AllCoalesce
                    } else {
                        Token::All
                    }
                }
                Some(kw) => kw,
                None if w.bytes().all(|b| b.is_ascii_digit()) => Token::Number(w),
                None if iter.peek() == Some(&Lexeme::Symbol('(')) => Token::FuncName(w),
                None => Token::Ident(w),
            },
        };
        out.push(token);
    }

    out
}
