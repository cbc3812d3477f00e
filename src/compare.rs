use serde_json::Value;

use std::collections::BTreeSet;
use std::fmt::{self, Display, Write};

type JsonObject = serde_json::Map<String, Value>;

#[derive(Debug, PartialEq)]
pub struct Diff<'a> {
    pub path: String,
    pub existing: &'a Value,
    pub desired: &'a Value,
}

impl<'a> Display for Diff<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "'{}' existing: {}, desired: {}",
            self.path, self.existing, self.desired
        )
    }
}

pub struct Diffs<'a>(Vec<Diff<'a>>);

impl<'a> Diffs<'a> {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diff<'a>> {
        self.0.iter()
    }
}

impl<'a> Display for Diffs<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("<empty>");
        }
        write!(f, "{} differences: ", self.0.len())?;
        for (i, diff) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            Display::fmt(diff, f)?;
        }
        Ok(())
    }
}

enum Segment<'a> {
    Key(&'a str),
    Index(usize),
}

/// Compares an existing object from the api server with the object we'd like it to be. The
/// diff is empty as long as `existing` is a superset of `desired`, so fields that the api
/// server defaults (or that other controllers own) never show up as differences. A `null` in
/// `desired` means "absent" and matches a missing field.
///
/// Arrays are owned as a whole: existing items beyond the desired ones are differences, since a
/// merge patch replaces the entire array anyway. When every desired item is an object with a
/// unique string `name` (containers, env vars, volumes, ports), items are matched up by name
/// rather than by position. All other arrays, including volume mounts that share a volume
/// name, are compared position by position. An empty desired array matches a missing field.
pub fn compare_values<'a>(existing: &'a Value, desired: &'a Value) -> Diffs<'a> {
    let mut diffs = Vec::new();
    let mut path = Vec::with_capacity(8);
    compare(&mut diffs, &mut path, existing, desired);
    Diffs(diffs)
}

fn compare<'a>(
    diffs: &mut Vec<Diff<'a>>,
    path: &mut Vec<Segment<'a>>,
    existing: &'a Value,
    desired: &'a Value,
) {
    match (existing, desired) {
        (Value::Object(ref existing_map), Value::Object(ref desired_map)) => {
            for (key, desired_val) in desired_map.iter() {
                compare_field(diffs, path, existing_map, key, desired_val);
            }
        }
        (Value::Array(ref existing_items), Value::Array(ref desired_items)) => {
            compare_arrays(diffs, path, existing_items, desired_items);
        }
        (a, b) if a != b => {
            diffs.push(diff(&*path, a, b));
        }
        _ => {}
    }
}

fn compare_field<'a>(
    diffs: &mut Vec<Diff<'a>>,
    path: &mut Vec<Segment<'a>>,
    existing: &'a JsonObject,
    key: &'a str,
    desired: &'a Value,
) {
    path.push(Segment::Key(key));
    match existing.get(key) {
        Some(existing_val) => compare(diffs, path, existing_val, desired),
        None if desired.is_null() || is_empty_array(desired) => {}
        None => diffs.push(diff(&*path, &Value::Null, desired)),
    }
    path.pop();
}

fn item_name(value: &Value) -> Option<&str> {
    value.get("name").and_then(Value::as_str)
}

fn is_empty_array(value: &Value) -> bool {
    value.as_array().map_or(false, |items| items.is_empty())
}

/// The names of the desired items, if all of them have one and no two are the same
fn unique_names(items: &[Value]) -> Option<Vec<&str>> {
    let names = items.iter().map(item_name).collect::<Option<Vec<_>>>()?;
    let distinct = names.iter().collect::<BTreeSet<_>>().len();
    if distinct == names.len() {
        Some(names)
    } else {
        None
    }
}

fn compare_arrays<'a>(
    diffs: &mut Vec<Diff<'a>>,
    path: &mut Vec<Segment<'a>>,
    existing: &'a [Value],
    desired: &'a [Value],
) {
    let desired_names = unique_names(desired);

    for (i, desired_item) in desired.iter().enumerate() {
        path.push(Segment::Index(i));
        let existing_item = match desired_names {
            Some(ref names) => existing
                .iter()
                .find(|e| item_name(e) == Some(names[i])),
            None => existing.get(i),
        };
        match existing_item {
            Some(existing_match) => compare(diffs, path, existing_match, desired_item),
            None => diffs.push(diff(&*path, &Value::Null, desired_item)),
        }
        path.pop();
    }

    let surplus = match desired_names {
        Some(ref names) => existing
            .iter()
            .filter(|e| item_name(e).map_or(true, |name| !names.contains(&name)))
            .collect::<Vec<_>>(),
        None => existing.iter().skip(desired.len()).collect(),
    };
    for (i, extra) in surplus.into_iter().enumerate() {
        path.push(Segment::Index(desired.len() + i));
        diffs.push(diff(&*path, extra, &Value::Null));
        path.pop();
    }
}

fn diff<'a>(path: &[Segment], existing: &'a Value, desired: &'a Value) -> Diff<'a> {
    let mut p = String::with_capacity(16);
    for s in path.iter() {
        p.push('.');
        match s {
            Segment::Key(k) => p.push_str(k),
            Segment::Index(i) => {
                let _ = write!(p, "{}", i);
            }
        }
    }
    Diff {
        path: p,
        existing,
        desired,
    }
}
