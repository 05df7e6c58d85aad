//! Parser for the model description language.

use std::collections::HashMap;

use super::ast::*;
use super::lexer::{parse_value, Lexer, Token, TokenKind};
use crate::error::{DendriteError, Result};
use crate::solver::{LayoutMode, Stiffness};

/// Keyword that starts a node declaration.
const NODE_KEYWORD: &str = "node";

/// Parser for model descriptions.
pub struct Parser<'a> {
    lexer: Lexer<'a>,
    current: Token,
}

impl<'a> Parser<'a> {
    /// Create a new parser with the given lexer.
    pub fn new(mut lexer: Lexer<'a>) -> Result<Self> {
        let current = lexer.next_token()?;
        Ok(Self { lexer, current })
    }

    /// Parse the entire description.
    pub fn parse(&mut self) -> Result<ModelAst> {
        let mut ast = ModelAst::new();

        while self.current.kind != TokenKind::Eof {
            match self.current.kind {
                TokenKind::Newline => {}
                TokenKind::Directive => {
                    let def = self.parse_directive()?;
                    ast.directives.push(def);
                }
                TokenKind::Identifier if self.current.text.eq_ignore_ascii_case(NODE_KEYWORD) => {
                    let node = self.parse_node()?;
                    ast.nodes.push(node);
                }
                TokenKind::Identifier => {
                    let mechanism = self.parse_mechanism()?;
                    ast.mechanisms.push(mechanism);
                }
                _ => {
                    return Err(DendriteError::parse(
                        self.current.line,
                        format!("unexpected token: {:?}", self.current.text),
                    ));
                }
            }
            self.end_of_line()?;
        }

        Ok(ast)
    }

    fn advance(&mut self) -> Result<()> {
        self.current = self.lexer.next_token()?;
        Ok(())
    }

    fn at_line_end(&self) -> bool {
        matches!(self.current.kind, TokenKind::Newline | TokenKind::Eof)
    }

    /// Consume the newline ending a statement, rejecting trailing tokens.
    fn end_of_line(&mut self) -> Result<()> {
        match self.current.kind {
            TokenKind::Newline => self.advance(),
            TokenKind::Eof => Ok(()),
            _ => Err(DendriteError::parse(
                self.current.line,
                format!("unexpected trailing token: {:?}", self.current.text),
            )),
        }
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> Result<Token> {
        if self.current.kind == kind {
            let tok = self.current.clone();
            self.advance()?;
            Ok(tok)
        } else {
            Err(DendriteError::parse(
                self.current.line,
                format!("expected {}, got {:?}", what, self.current.text),
            ))
        }
    }

    fn number(&mut self, what: &str) -> Result<f64> {
        let line = self.current.line;
        let tok = self.expect(TokenKind::Number, what)?;
        parse_value(&tok.text)
            .ok_or_else(|| DendriteError::parse(line, format!("invalid number: {}", tok.text)))
    }

    fn count(&mut self, what: &str) -> Result<usize> {
        let line = self.current.line;
        let value = self.number(what)?;
        as_count(value).ok_or_else(|| {
            DendriteError::parse(line, format!("{} must be a non-negative integer, got {}", what, value))
        })
    }

    /// Parse `key=value` pairs up to the end of the line.
    fn parse_params(&mut self) -> Result<Vec<(String, f64, usize)>> {
        let mut params = Vec::new();
        while !self.at_line_end() {
            let line = self.current.line;
            let key = self.expect(TokenKind::Identifier, "parameter name")?.text;
            self.expect(TokenKind::Equals, "'='")?;
            let value = self.number("parameter value")?;
            params.push((key.to_lowercase(), value, line));
        }
        Ok(params)
    }

    fn parse_directive(&mut self) -> Result<DirectiveDef> {
        let name = self.current.text.to_lowercase();
        let line = self.current.line;
        self.advance()?;

        let directive = match name.as_str() {
            ".atol" => Directive::Atol(self.number("tolerance")?),
            ".vtol" => Directive::Vtol(self.number("tolerance scale")?),
            ".stiff" => {
                let level = self.count("stiffness level")?;
                let stiffness = u8::try_from(level)
                    .ok()
                    .and_then(Stiffness::from_level)
                    .ok_or_else(|| DendriteError::parse(line, format!("stiffness level must be 0, 1 or 2, got {}", level)))?;
                Directive::Stiff(stiffness)
            }
            ".layout" => {
                let keyword = self.expect(TokenKind::Identifier, "layout mode")?.text;
                let mode = LayoutMode::from_keyword(&keyword)
                    .ok_or_else(|| DendriteError::parse(line, format!("unknown layout mode: {}", keyword)))?;
                Directive::Layout(mode)
            }
            ".threads" => Directive::Threads(self.count("thread count")?),
            ".dt" => Directive::Dt(self.number("step size")?),
            ".tstop" => Directive::Tstop(self.number("stop time")?),
            ".extracellular" => Directive::Extracellular(self.count("layer count")?),
            ".probe" => Directive::Probe(self.expect(TokenKind::Identifier, "node name")?.text),
            _ => {
                return Err(DendriteError::parse(line, format!("unknown directive: {}", name)));
            }
        };

        Ok(DirectiveDef { directive, line })
    }

    fn parse_node(&mut self) -> Result<NodeDef> {
        let line = self.current.line;
        self.advance()?;
        let name = self.expect(TokenKind::Identifier, "node name")?.text;

        let mut node = NodeDef {
            name,
            parent: None,
            g: None,
            cm: None,
            v: None,
            part: None,
            split: None,
            ext: false,
            line,
        };

        // A bare identifier after the name is the parent.
        let mut params = Vec::new();
        if self.current.kind == TokenKind::Identifier {
            let tok = self.current.clone();
            self.advance()?;
            if self.current.kind == TokenKind::Equals {
                self.advance()?;
                let value = self.number("parameter value")?;
                params.push((tok.text.to_lowercase(), value, tok.line));
            } else {
                node.parent = Some(tok.text);
            }
        }
        params.extend(self.parse_params()?);

        for (key, value, at) in params {
            match key.as_str() {
                "g" => node.g = Some(value),
                "cm" => node.cm = Some(value),
                "v" => node.v = Some(value),
                "part" => node.part = Some(integer_param(&node.name, &key, value)?),
                "split" => node.split = Some(integer_param(&node.name, &key, value)? as u64),
                "ext" => node.ext = value != 0.0,
                _ => {
                    return Err(DendriteError::InvalidParameter {
                        owner: node.name.clone(),
                        param: key,
                        message: format!("unknown node parameter at line {}", at),
                    });
                }
            }
        }

        Ok(node)
    }

    fn parse_mechanism(&mut self) -> Result<MechanismDef> {
        let line = self.current.line;
        let keyword = self.current.text.to_lowercase();
        self.advance()?;
        let name = self.expect(TokenKind::Identifier, "instance name")?.text;
        let node = self.expect(TokenKind::Identifier, "node name")?.text;

        let mut params = HashMap::new();
        for (key, value, _) in self.parse_params()? {
            if params.insert(key.clone(), value).is_some() {
                return Err(DendriteError::invalid_instance(
                    &name,
                    line,
                    format!("parameter '{}' given twice", key),
                ));
            }
        }

        Ok(MechanismDef {
            keyword,
            name,
            node,
            params,
            line,
        })
    }
}

fn integer_param(owner: &str, param: &str, value: f64) -> Result<usize> {
    as_count(value).ok_or_else(|| DendriteError::InvalidParameter {
        owner: owner.to_string(),
        param: param.to_string(),
        message: format!("must be a non-negative integer, got {}", value),
    })
}

/// Exact non-negative integer value, if `value` is one.
fn as_count(value: f64) -> Option<usize> {
    (value >= 0.0 && value.fract() == 0.0 && value <= u32::MAX as f64).then(|| value as usize)
}

#[cfg(test)]
mod tests {
    use super::super::parse;
    use super::*;

    #[test]
    fn test_parse_nodes() {
        let ast = parse("node soma cm=1 v=-65 part=1\nnode dend soma g=0.5 cm=0 ext=1\n").unwrap();
        assert_eq!(ast.nodes.len(), 2);
        assert_eq!(ast.nodes[0].parent, None);
        assert_eq!(ast.nodes[0].part, Some(1));
        assert_eq!(ast.nodes[0].v, Some(-65.0));
        assert_eq!(ast.nodes[1].parent.as_deref(), Some("soma"));
        assert_eq!(ast.nodes[1].g, Some(0.5));
        assert_eq!(ast.nodes[1].cm, Some(0.0));
        assert!(ast.nodes[1].ext);
        assert_eq!(ast.nodes[1].line, 2);
    }

    #[test]
    fn test_parse_mechanism() {
        let ast = parse("cadecay cad soma tau=100 cainf=50u").unwrap();
        let m = &ast.mechanisms[0];
        assert_eq!(m.keyword, "cadecay");
        assert_eq!(m.name, "cad");
        assert_eq!(m.node, "soma");
        assert!((m.params["cainf"] - 5e-5).abs() < 1e-18);
    }

    #[test]
    fn test_parse_directives() {
        let ast = parse(".atol 1e-4\n.stiff 1\n.layout implicit\n.probe soma\n.threads 2").unwrap();
        let directives: Vec<Directive> = ast.directives.into_iter().map(|d| d.directive).collect();
        assert_eq!(
            directives,
            vec![
                Directive::Atol(1e-4),
                Directive::Stiff(Stiffness::Voltage),
                Directive::Layout(LayoutMode::Implicit),
                Directive::Probe("soma".to_string()),
                Directive::Threads(2),
            ]
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(parse(".stiff 3"), Err(DendriteError::ParseError { line: 1, .. })));
        assert!(matches!(parse(".bogus 1"), Err(DendriteError::ParseError { .. })));
        assert!(matches!(
            parse("node soma diam=3"),
            Err(DendriteError::InvalidParameter { .. })
        ));
        assert!(matches!(parse("node soma part=1.5"), Err(DendriteError::InvalidParameter { .. })));
        assert!(matches!(parse("pas leak"), Err(DendriteError::ParseError { .. })));
        assert!(matches!(
            parse("pas leak soma g=1 g=2"),
            Err(DendriteError::InvalidInstance { .. })
        ));
    }

    #[test]
    fn test_parse_with_comments() {
        let input = "# ball and stick\nnode soma ; root\n\nhh hh1 soma # default kinetics\n";
        let ast = parse(input).unwrap();
        assert_eq!(ast.nodes.len(), 1);
        assert_eq!(ast.mechanisms.len(), 1);
    }
}
