use crate::language::{
    ast::*,
    errors::SyntaxError,
    span::{LineIndex, Span},
};
use nom::{
    branch::alt,
    bytes::complete::{tag, take_till, take_while},
    character::complete::{char, digit1, multispace1, satisfy, space0, space1},
    combinator::{cut, eof, map, map_res, not, opt, recognize, value},
    error::{context, ErrorKind, ParseError, VerboseError, VerboseErrorKind},
    multi::{many0, separated_list1},
    sequence::{delimited, pair, preceded, terminated, tuple},
    IResult,
};
use std::collections::HashSet;

type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

const KEYWORDS: &[&str] = &[
    "def", "begin", "rescue", "else", "ensure", "if", "puts", "set", "incr", "raise", "return",
    "retry", "nil",
];

pub fn parse_program(source: &str) -> Result<Program, SyntaxError> {
    let parser = Parser::new(source);
    let program = parser.run()?;

    let mut seen = HashSet::new();
    for method in &program.methods {
        if !seen.insert(method.name.as_str()) {
            return Err(
                SyntaxError::new(format!("method `{}` is defined twice", method.name), method.span)
                    .with_label("duplicate definition")
                    .with_help("rename one of the methods"),
            );
        }
    }
    Ok(program)
}

struct Parser<'a> {
    source: &'a str,
    lines: LineIndex,
}

impl<'a> Parser<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            source,
            lines: LineIndex::new(source),
        }
    }

    fn offset(&self, rest: &str) -> usize {
        self.source.len() - rest.len()
    }

    fn run(&self) -> Result<Program, SyntaxError> {
        let parsed = terminated(
            preceded(ws, many0(terminated(|i: &'a str| self.method(i), ws))),
            context("`def`", eof),
        )(self.source);
        match parsed {
            Ok((_, methods)) => Ok(Program { methods }),
            Err(nom::Err::Error(err)) | Err(nom::Err::Failure(err)) => Err(self.syntax_error(err)),
            Err(nom::Err::Incomplete(_)) => Err(SyntaxError::new(
                "unexpected end of input",
                Span::new(self.source.len(), self.source.len()),
            )),
        }
    }

    fn syntax_error(&self, err: VerboseError<&'a str>) -> SyntaxError {
        let offset = err
            .errors
            .first()
            .map(|(input, _)| self.offset(input))
            .unwrap_or(0);
        let expected = err.errors.iter().find_map(|(_, kind)| match kind {
            VerboseErrorKind::Context(ctx) => Some(*ctx),
            _ => None,
        });
        let end = (offset + 1).min(self.source.len());
        let found = self.source[offset..]
            .chars()
            .next()
            .map(|ch| format!("`{ch}`"))
            .unwrap_or_else(|| "end of input".to_string());
        let message = match expected {
            Some(expected) => format!("expected {expected}, found {found}"),
            None => format!("unexpected {found}"),
        };
        let error = SyntaxError::new(message, Span::new(offset, end)).with_label("here");
        match expected {
            Some("`}`") => error.with_help("blocks are wrapped in `{` and `}`"),
            Some("statement") => error.with_help(
                "statements are puts, set, incr, raise, return, retry, if and begin",
            ),
            _ => error,
        }
    }

    fn method(&self, input: &'a str) -> PResult<'a, MethodDef> {
        let start = self.offset(input);
        let (rest, (name, body)) = preceded(
            keyword("def"),
            cut(pair(
                preceded(space1, context("method name", identifier)),
                preceded(ws, |i: &'a str| self.block(i)),
            )),
        )(input)?;
        Ok((
            rest,
            MethodDef {
                name,
                body,
                span: Span::new(start, self.offset(rest)),
            },
        ))
    }

    fn block(&self, input: &'a str) -> PResult<'a, Vec<Stmt>> {
        preceded(
            context("`{`", char('{')),
            cut(terminated(
                many0(preceded(ws, |i: &'a str| self.stmt(i))),
                preceded(ws, context("`}`", char('}'))),
            )),
        )(input)
    }

    fn stmt(&self, input: &'a str) -> PResult<'a, Stmt> {
        let start = self.offset(input);
        let (rest, kind) = alt((
            |i: &'a str| self.begin_stmt(i),
            |i: &'a str| self.if_stmt(i),
            puts_stmt,
            set_stmt,
            incr_stmt,
            raise_stmt,
            return_stmt,
            value(StmtKind::Retry, keyword("retry")),
        ))(input)?;
        Ok((
            rest,
            Stmt {
                kind,
                span: Span::new(start, self.offset(rest)),
                line: self.lines.line(start),
            },
        ))
    }

    fn begin_stmt(&self, input: &'a str) -> PResult<'a, StmtKind> {
        let (rest, _) = keyword("begin")(input)?;
        let (rest, body) = cut(preceded(ws, |i: &'a str| self.block(i)))(rest)?;
        let (rest, rescues) = many0(preceded(ws, |i: &'a str| self.rescue_clause(i)))(rest)?;
        let (rest, else_body) = opt(preceded(
            tuple((ws, keyword("else"), ws)),
            cut(|i: &'a str| self.block(i)),
        ))(rest)?;
        let (rest, ensure_body) = opt(preceded(
            tuple((ws, keyword("ensure"), ws)),
            cut(|i: &'a str| self.block(i)),
        ))(rest)?;
        Ok((
            rest,
            StmtKind::Begin(BeginBlock {
                body,
                rescues,
                else_body,
                ensure_body,
            }),
        ))
    }

    fn rescue_clause(&self, input: &'a str) -> PResult<'a, RescueClause> {
        let start = self.offset(input);
        let (rest, _) = keyword("rescue")(input)?;
        let (rest, classes) = opt(preceded(
            space1,
            separated_list1(tuple((space0, char(','), space0)), constant),
        ))(rest)?;
        let (rest, binding) = opt(preceded(
            tuple((space0, tag("=>"), space0)),
            cut(context("binding name", identifier)),
        ))(rest)?;
        let (rest, body) = cut(preceded(ws, |i: &'a str| self.block(i)))(rest)?;
        Ok((
            rest,
            RescueClause {
                classes: classes.unwrap_or_default(),
                binding,
                body,
                span: Span::new(start, self.offset(rest)),
            },
        ))
    }

    fn if_stmt(&self, input: &'a str) -> PResult<'a, StmtKind> {
        let (rest, _) = keyword("if")(input)?;
        let (rest, (lhs, op, rhs)) = cut(tuple((
            preceded(space1, expr),
            preceded(space0, context("comparison operator", cmp_op)),
            preceded(space0, expr),
        )))(rest)?;
        let (rest, then_body) = cut(preceded(ws, |i: &'a str| self.block(i)))(rest)?;
        let (rest, else_body) = opt(preceded(
            tuple((ws, keyword("else"), ws)),
            cut(|i: &'a str| self.block(i)),
        ))(rest)?;
        Ok((
            rest,
            StmtKind::If(IfStmt {
                lhs,
                op,
                rhs,
                then_body,
                else_body,
            }),
        ))
    }
}

fn is_ident_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || ch == '_'
}

fn ws(input: &str) -> PResult<'_, ()> {
    value((), many0(alt((multispace1, comment))))(input)
}

fn comment(input: &str) -> PResult<'_, &str> {
    recognize(pair(char('#'), take_till(|ch: char| ch == '\n')))(input)
}

fn keyword<'a>(word: &'static str) -> impl FnMut(&'a str) -> PResult<'a, &'a str> {
    terminated(tag(word), not(satisfy(is_ident_char)))
}

fn identifier(input: &str) -> PResult<'_, String> {
    let (rest, name) = recognize(pair(
        satisfy(|ch: char| ch.is_ascii_lowercase() || ch == '_'),
        take_while(is_ident_char),
    ))(input)?;
    if KEYWORDS.contains(&name) {
        return Err(nom::Err::Error(VerboseError::from_error_kind(
            input,
            ErrorKind::Tag,
        )));
    }
    Ok((rest, name.to_string()))
}

fn constant(input: &str) -> PResult<'_, String> {
    map(
        recognize(pair(
            satisfy(|ch: char| ch.is_ascii_uppercase()),
            take_while(|ch: char| is_ident_char(ch) || ch == ':'),
        )),
        str::to_string,
    )(input)
}

fn string_literal(input: &str) -> PResult<'_, String> {
    map(
        delimited(
            char('"'),
            take_till(|ch: char| ch == '"' || ch == '\n'),
            cut(context("closing `\"`", char('"'))),
        ),
        str::to_string,
    )(input)
}

fn integer(input: &str) -> PResult<'_, i64> {
    map_res(recognize(pair(opt(char('-')), digit1)), str::parse::<i64>)(input)
}

fn expr(input: &str) -> PResult<'_, Expr> {
    context(
        "expression",
        alt((
            value(Expr::Nil, keyword("nil")),
            value(Expr::ErrInfo, tag("$!")),
            map(integer, Expr::Int),
            map(string_literal, Expr::Str),
            map(identifier, Expr::Var),
        )),
    )(input)
}

fn cmp_op(input: &str) -> PResult<'_, CmpOp> {
    alt((
        value(CmpOp::Eq, tag("==")),
        value(CmpOp::Ne, tag("!=")),
        value(CmpOp::Le, tag("<=")),
        value(CmpOp::Ge, tag(">=")),
        value(CmpOp::Lt, tag("<")),
        value(CmpOp::Gt, tag(">")),
    ))(input)
}

fn puts_stmt(input: &str) -> PResult<'_, StmtKind> {
    map(
        preceded(keyword("puts"), cut(preceded(space1, expr))),
        StmtKind::Puts,
    )(input)
}

fn set_stmt(input: &str) -> PResult<'_, StmtKind> {
    map(
        preceded(
            keyword("set"),
            cut(pair(
                preceded(space1, context("variable name", identifier)),
                preceded(tuple((space0, context("`=`", char('=')), space0)), expr),
            )),
        ),
        |(name, value)| StmtKind::Set { name, value },
    )(input)
}

fn incr_stmt(input: &str) -> PResult<'_, StmtKind> {
    map(
        preceded(
            keyword("incr"),
            cut(preceded(space1, context("variable name", identifier))),
        ),
        StmtKind::Incr,
    )(input)
}

fn raise_stmt(input: &str) -> PResult<'_, StmtKind> {
    map(
        preceded(
            keyword("raise"),
            cut(pair(
                preceded(space1, context("exception class", constant)),
                opt(preceded(
                    tuple((space0, char(','), space0)),
                    cut(context("message string", string_literal)),
                )),
            )),
        ),
        |(class, message)| StmtKind::Raise { class, message },
    )(input)
}

fn return_stmt(input: &str) -> PResult<'_, StmtKind> {
    map(
        preceded(keyword("return"), opt(preceded(space1, expr))),
        StmtKind::Return,
    )(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_full_exception_construct() {
        let program = parse_program(
            r#"
            # retries a flaky step
            def flaky {
              set tries = 0
              begin {
                incr tries
                raise Timeout, "slow"
              } rescue Timeout, IOError => e {
                if tries < 3 { retry }
                puts e
              } rescue {
                puts "other"
              } else {
                puts "fine"
              } ensure {
                puts $!
              }
              return tries
            }
            "#,
        )
        .unwrap();

        let method = program.method("flaky").unwrap();
        assert_eq!(method.body.len(), 3);
        let StmtKind::Begin(begin) = &method.body[1].kind else {
            panic!("expected a begin block");
        };
        assert_eq!(method.body[1].line, 5);
        assert_eq!(begin.body.len(), 2);
        assert_eq!(begin.rescues.len(), 2);
        assert_eq!(begin.rescues[0].classes, vec!["Timeout", "IOError"]);
        assert_eq!(begin.rescues[0].binding.as_deref(), Some("e"));
        assert!(begin.rescues[1].classes.is_empty());
        assert!(begin.else_body.is_some());
        assert!(matches!(
            begin.ensure_body.as_deref(),
            Some([Stmt {
                kind: StmtKind::Puts(Expr::ErrInfo),
                ..
            }])
        ));
        assert!(matches!(
            method.body[2].kind,
            StmtKind::Return(Some(Expr::Var(_)))
        ));
    }

    #[test]
    fn bare_return_and_keyword_prefixed_names() {
        let program = parse_program("def m {\n  set retry_count = 1\n  return\n}\n").unwrap();
        let body = &program.methods[0].body;
        assert!(matches!(&body[0].kind, StmtKind::Set { name, .. } if name == "retry_count"));
        assert!(matches!(body[1].kind, StmtKind::Return(None)));
    }

    #[test]
    fn reports_missing_closing_brace() {
        let err = parse_program("def m {\n  puts 1\n").unwrap_err();
        assert_eq!(err.message, "expected `}`, found end of input");
        assert!(err.help.is_some());
    }

    #[test]
    fn reports_unknown_statements() {
        let err = parse_program("def m {\n  frobnicate\n}").unwrap_err();
        assert_eq!(err.span.start, 10);
        assert!(err.message.starts_with("expected `}`"), "{}", err.message);
    }

    #[test]
    fn rejects_duplicate_methods() {
        let err = parse_program("def m { }\ndef m { }").unwrap_err();
        assert_eq!(err.message, "method `m` is defined twice");
        assert_eq!(err.span.start, 10);
    }
}
