use std::collections::BTreeMap;

use super::{Path, PathElem};

/// Parse an xpath-style subscription path into a [`Path`].
///
/// An `origin:` prefix before the first `/` is split off, list keys inside
/// brackets keep `/` verbatim, and `\[`/`\]` escape brackets in key values.
/// On failure the unparsable remainder of the input is returned.
pub fn parse(input: &str) -> Result<Path, &str> {
    let (origin, input) = match input.split_once(':') {
        Some((origin, rest))
            if !origin.is_empty() && !origin.contains('/') && !origin.contains('[') =>
        {
            (Some(origin.to_string()), rest)
        }
        _ => (None, input),
    };

    if input.is_empty() {
        return Ok(Path {
            origin,
            ..Default::default()
        });
    }

    let chars = input.char_indices();
    let mut elem = Vec::new();

    let mut inside_brackets = false;
    let mut start = 0usize;
    let mut key_start = 0;
    let mut key = input;
    let mut value_start = 0;
    let mut current = PathElem::default();
    let mut escaping = false;

    for (index, ch) in chars {
        match ch {
            '/' => {
                if inside_brackets {
                    continue;
                }

                if start == index {
                    start = index + 1;
                    continue;
                }

                if current.name.is_empty() {
                    current.name = input[start..index].to_string();
                }

                elem.push(current);
                current = PathElem::default();

                start = index + 1;
            }
            '[' => {
                if escaping {
                    escaping = false;
                    continue;
                }

                if inside_brackets {
                    return Err(&input[index..]);
                }

                inside_brackets = true;
                key_start = index + 1;

                if current.name.is_empty() {
                    current.name = input[start..index].to_string();
                }
            }
            '=' => {
                if escaping {
                    escaping = false;
                    continue;
                }

                if !inside_brackets {
                    return Err(&input[index..]);
                }

                key = &input[key_start..index];
                value_start = index + 1;
            }
            ']' => {
                if escaping {
                    escaping = false;
                    continue;
                }

                if !inside_brackets {
                    return Err(&input[index..]);
                }

                inside_brackets = false;

                current
                    .key
                    .insert(key.to_string(), unescape(&input[value_start..index]));
            }
            '\\' => {
                escaping = true;
            }
            _ => {}
        }
    }

    if inside_brackets {
        return Err(&input[key_start..]);
    }

    if !current.name.is_empty() {
        elem.push(current);
    } else if start < input.len() {
        elem.push(PathElem {
            name: input[start..].to_string(),
            ..Default::default()
        });
    }

    Ok(Path {
        origin,
        elem,
        ..Default::default()
    })
}

fn unescape(input: &str) -> String {
    input.replace("\\[", "[").replace("\\]", "]")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keyed(name: &str, pairs: &[(&str, &str)]) -> PathElem {
        PathElem {
            name: name.to_string(),
            key: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    fn named(name: &str) -> PathElem {
        PathElem {
            name: name.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn parse_element() {
        for (input, expected) in [
            ("", Some(vec![])),
            ("a/b/c", Some(vec![named("a"), named("b"), named("c")])),
            ("/a/b/c", Some(vec![named("a"), named("b"), named("c")])),
            ("/a/b/c/", Some(vec![named("a"), named("b"), named("c")])),
            (
                "/a/b[k1=10]/c",
                Some(vec![named("a"), keyed("b", &[("k1", "10")]), named("c")]),
            ),
            (
                "/a/b[k1=10.10.10.10/24]/c",
                Some(vec![
                    named("a"),
                    keyed("b", &[("k1", "10.10.10.10/24")]),
                    named("c"),
                ]),
            ),
            (
                r#"/a/b[k1=10.10.10.10\[24]/c"#,
                Some(vec![
                    named("a"),
                    keyed("b", &[("k1", "10.10.10.10[24")]),
                    named("c"),
                ]),
            ),
            (
                r#"/a/b[k1=10.10.10.10\]24]/c"#,
                Some(vec![
                    named("a"),
                    keyed("b", &[("k1", "10.10.10.10]24")]),
                    named("c"),
                ]),
            ),
            (
                "/a/b[k1=v1]/c/d[k2=v2]/e",
                Some(vec![
                    named("a"),
                    keyed("b", &[("k1", "v1")]),
                    named("c"),
                    keyed("d", &[("k2", "v2")]),
                    named("e"),
                ]),
            ),
            (
                "/a/b[k1=exact][k2=10.10.10.10/24]/c",
                Some(vec![
                    named("a"),
                    keyed("b", &[("k1", "exact"), ("k2", "10.10.10.10/24")]),
                    named("c"),
                ]),
            ),
            // missing ] in second key-value string
            (r#"/a/b[k1=10][k2=abc/c"#, None),
            // unescaped [ in second key leaf name
            (r#"/a/b[k1=10][[k2=abc]/c"#, None),
            // = outside of a list key
            (r#"/a/b[k1=10]k2=abc/c"#, None),
        ] {
            match parse(input) {
                Ok(got) => {
                    let expected =
                        expected.unwrap_or_else(|| panic!("input {:?} should not parse", input));
                    assert_eq!(got.elem, expected, "input: \"{}\"", input);
                }
                Err(err) => {
                    assert!(expected.is_none(), "input: \"{}\"\nerror at: {}", input, err);
                }
            }
        }
    }

    #[test]
    fn parse_origin() {
        let path = parse("openconfig:/interfaces/interface[name=mgmt0]").unwrap();
        assert_eq!(path.origin.as_deref(), Some("openconfig"));
        assert_eq!(path.elem.len(), 2);

        // a key value containing ':' does not start an origin
        let path = parse("/a/b[k1=foo:bar]").unwrap();
        assert_eq!(path.origin, None);
        assert_eq!(path.elem[1].key["k1"], "foo:bar");
    }

    #[test]
    fn roundtrip_display() {
        let path = parse("/interfaces/interface[name=ethernet1/1]/state").unwrap();
        assert_eq!(
            path.to_xpath(),
            "/interfaces/interface[name=ethernet1/1]/state"
        );
    }
}
