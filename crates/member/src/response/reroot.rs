//! Re-rooting registration rows into a query's key space
//!
//! A registration answers with keys from its own subtree. Before a row can
//! join a query result it is moved onto the query key: rows from deeper
//! registrations are folded back up to the query depth, rows from shallower
//! registrations fan out into every descendant the query's remaining
//! segments reach.

use crate::error::{Error, Result};
use databus_common::{KeyPath, Payload, Segment};
use databus_protocol::ResultRow;

/// Child of an object by name, or of an array by index
pub(crate) fn child_of<'a>(node: &'a Payload, name: &str) -> Option<&'a Payload> {
    match node {
        Payload::Object(map) => map.get(name),
        Payload::Array(items) => name.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    }
}

/// Re-root one `(local_key, payload)` pair onto `query_key`
pub fn reroot(local_key: &KeyPath, payload: &Payload, query_key: &KeyPath) -> Result<Vec<ResultRow>> {
    let mismatch = || Error::KeyMismatch {
        local: local_key.clone(),
        query: query_key.clone(),
    };

    let common = local_key.depth().min(query_key.depth());
    if !local_key.truncated(common).overlaps(&query_key.truncated(common)) {
        return Err(mismatch());
    }

    let depth = query_key.depth();
    if local_key.depth() >= depth {
        let mut wrapped = payload.clone();
        for segment in local_key.suffix(depth).iter().rev() {
            let name = segment.as_name().ok_or_else(mismatch)?;
            let mut map = serde_json::Map::new();
            map.insert(name.to_string(), wrapped);
            wrapped = Payload::Object(map);
        }
        return Ok(vec![ResultRow::new(local_key.truncated(depth), wrapped)]);
    }

    let mut rows = Vec::new();
    expand(
        local_key.clone(),
        payload,
        query_key.suffix(local_key.depth()),
        &mut rows,
    );
    Ok(rows)
}

fn expand(key: KeyPath, node: &Payload, rest: &[Segment], rows: &mut Vec<ResultRow>) {
    let Some((segment, rest)) = rest.split_first() else {
        rows.push(ResultRow::new(key, node.clone()));
        return;
    };

    match segment {
        Segment::Name(name) => {
            if let Some(child) = child_of(node, name) {
                expand(key.child(segment.clone()), child, rest, rows);
            }
        }
        Segment::Wildcard => match node {
            Payload::Object(map) => {
                for (name, child) in map {
                    expand(key.child(Segment::name(name.clone())), child, rest, rows);
                }
            }
            Payload::Array(items) => {
                for (index, child) in items.iter().enumerate() {
                    expand(key.child(Segment::Name(index.to_string())), child, rest, rows);
                }
            }
            _ => {}
        },
    }
}
