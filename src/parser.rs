use std::borrow::Cow;

use pest::{Parser, iterators::Pair};
use pest_derive::Parser;

use crate::ast::{Body, Clause, Segment, Tag};
use crate::error::ParseError;

#[derive(Parser)]
#[grammar = "src/passage.pest"]
pub struct PassageParser;

impl PassageParser {
    /// Parse passage source into text runs and macro tags.
    pub fn parse_source<'a>(input: &'a str) -> Result<Vec<Segment<'a>>, ParseError> {
        let mut pairs = PassageParser::parse(Rule::passage, input)?;
        let passage = pairs.next().ok_or(ParseError::MissingPassage)?;

        Ok(passage
            .into_inner()
            .filter_map(Self::parse_segment)
            .collect::<Vec<_>>())
    }

    fn parse_segment(pair: Pair<Rule>) -> Option<Segment> {
        match pair.as_rule() {
            Rule::text => Some(Segment::Text(Cow::Borrowed(pair.as_str()))),
            Rule::macro_tag => Self::parse_tag(pair).map(Segment::Tag),
            _ => None,
        }
    }

    fn parse_tag(pair: Pair<Rule>) -> Option<Tag> {
        let span = pair.as_span();
        let source = pair.as_str();
        let mut inner = pair.into_inner();

        let name = inner.next().map(|p| Cow::Borrowed(p.as_str()))?;
        let args = inner
            .next()
            .map(|p| Cow::Borrowed(p.as_str().trim_start()))
            .unwrap_or_default();

        Some(Tag {
            name,
            args,
            source,
            start: span.start(),
            end: span.end(),
        })
    }

    /// Pair the opening tag at `segments[open]` with its closing tag,
    /// splitting the body into clauses at any of `child_tags`.
    ///
    /// Nested tags of the same macro are balanced; child tags only split
    /// clauses at the outermost level.
    pub fn parse_body<'a>(
        source: &'a str,
        segments: &[Segment<'a>],
        open: usize,
        child_tags: &[String],
    ) -> Result<Body<'a>, String> {
        let Some(Segment::Tag(opening)) = segments.get(open) else {
            return Err("no opening tag to pair".to_string());
        };
        let parent = opening.name.as_ref();

        let mut opened = 1usize;
        let mut clauses = Vec::new();
        let mut name = opening.name.clone();
        let mut args = opening.args.clone();
        let mut clause_source = opening.source;
        let mut content_start = opening.end;

        for (index, segment) in segments.iter().enumerate().skip(open + 1) {
            let Segment::Tag(tag) = segment else {
                continue;
            };

            if tag.name == parent {
                opened += 1;
            } else if tag.closes(parent) {
                opened -= 1;
                if opened == 0 {
                    if !tag.args.trim().is_empty() {
                        return Err(format!(
                            "closing tag <<{}>> does not accept arguments",
                            tag.name
                        ));
                    }
                    clauses.push(Clause {
                        name,
                        args,
                        contents: &source[content_start..tag.start],
                        source: clause_source,
                    });
                    return Ok(Body {
                        clauses,
                        next: index + 1,
                        end: tag.end,
                    });
                }
            } else if opened == 1 && child_tags.iter().any(|child| *child == tag.name) {
                clauses.push(Clause {
                    name,
                    args,
                    contents: &source[content_start..tag.start],
                    source: clause_source,
                });
                name = tag.name.clone();
                args = tag.args.clone();
                clause_source = tag.source;
                content_start = tag.end;
            }
        }

        Err(format!("cannot find a closing tag for macro <<{parent}>>"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn tag<'a>(segment: &'a Segment<'a>) -> &'a Tag<'a> {
        match segment {
            Segment::Tag(tag) => tag,
            _ => panic!("Expected Tag segment"),
        }
    }

    #[test]
    fn test_parse_text_and_tag() {
        let input = "Hello <<print $name>>!";
        let segments = PassageParser::parse_source(input).unwrap();
        assert_eq!(segments.len(), 3);

        assert_eq!(segments[0], Segment::Text(Cow::Borrowed("Hello ")));
        let print = tag(&segments[1]);
        assert_eq!(print.name, "print");
        assert_eq!(print.args, "$name");
        assert_eq!(print.source, "<<print $name>>");
        assert_eq!((print.start, print.end), (6, 21));
        assert_eq!(segments[2], Segment::Text(Cow::Borrowed("!")));
    }

    #[test]
    fn test_parse_short_names() {
        let segments = PassageParser::parse_source("<<=1 + 2>><<-$x>><</if>>").unwrap();
        let names: Vec<&str> = segments.iter().map(|s| tag(s).name.as_ref()).collect();
        assert_eq!(names, vec!["=", "-", "/if"]);
        assert_eq!(tag(&segments[0]).args, "1 + 2");
    }

    #[test]
    fn test_parse_quoted_closers() {
        let input = r#"<<set $a to "x >> y">><<print `$a + ">>"`>><<link [[a>>b]]>>"#;
        let segments = PassageParser::parse_source(input).unwrap();
        assert_eq!(segments.len(), 3);
        assert_eq!(tag(&segments[0]).args, r#"$a to "x >> y""#);
        assert_eq!(tag(&segments[1]).args, r#"`$a + ">>"`"#);
        assert_eq!(tag(&segments[2]).args, "[[a>>b]]");
    }

    #[test]
    fn test_parse_empty_source() {
        assert_eq!(PassageParser::parse_source(""), Ok(Vec::new()));
    }

    #[test]
    fn test_parse_stray_openers_are_text() {
        let segments = PassageParser::parse_source("a << b <<>> c").unwrap();
        assert!(segments.iter().all(|s| matches!(s, Segment::Text(_))));
        let text: String = segments
            .iter()
            .map(|s| match s {
                Segment::Text(t) => t.as_ref(),
                Segment::Tag(_) => "",
            })
            .collect();
        assert_eq!(text, "a << b <<>> c");
    }

    #[test]
    fn test_parse_body_clauses() {
        let input = "<<if $a>>A<<elseif $b>>B<<else>>C<</if>>tail";
        let segments = PassageParser::parse_source(input).unwrap();
        let tags = vec!["elseif".to_string(), "else".to_string()];
        let body = PassageParser::parse_body(input, &segments, 0, &tags).unwrap();

        let clauses: Vec<(&str, &str, &str)> = body
            .clauses
            .iter()
            .map(|c| (c.name.as_ref(), c.args.as_ref(), c.contents))
            .collect();
        assert_eq!(
            clauses,
            vec![("if", "$a", "A"), ("elseif", "$b", "B"), ("else", "", "C")]
        );
        assert_eq!(body.clauses[1].source, "<<elseif $b>>");
        assert_eq!(&input[body.end..], "tail");
        assert_eq!(body.next, segments.len() - 1);
    }

    #[test]
    fn test_parse_body_nesting() {
        let input = "<<if 1>>a<<if 2>>b<<else>>c<<endif>>d<<else>>e<</if>>";
        let segments = PassageParser::parse_source(input).unwrap();
        let tags = vec!["elseif".to_string(), "else".to_string()];
        let body = PassageParser::parse_body(input, &segments, 0, &tags).unwrap();

        assert_eq!(body.clauses.len(), 2);
        assert_eq!(body.clauses[0].contents, "a<<if 2>>b<<else>>c<<endif>>d");
        assert_eq!(body.clauses[1].contents, "e");
        assert_eq!(body.end, input.len());
    }

    #[test]
    fn test_parse_body_errors() {
        let input = "<<repeat 1s>>tick";
        let segments = PassageParser::parse_source(input).unwrap();
        assert_eq!(
            PassageParser::parse_body(input, &segments, 0, &[]),
            Err("cannot find a closing tag for macro <<repeat>>".to_string())
        );

        let input = "<<repeat 1s>>tick<</repeat now>>";
        let segments = PassageParser::parse_source(input).unwrap();
        assert_eq!(
            PassageParser::parse_body(input, &segments, 0, &[]),
            Err("closing tag <</repeat>> does not accept arguments".to_string())
        );
    }
}
