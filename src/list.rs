//! Constructors and utilities over box-chain lists.
//!
//! Ownership convention: functions borrow their handle arguments and
//! retain internally whatever they store; every returned handle is owned
//! by the caller, who must release it (or hand it to something that
//! does).

use crate::heap::{BoxId, Heap, ValueId};
use crate::node::{self, Value};

/// `(a)`
pub fn make1(heap: &mut Heap, a: ValueId) -> ValueId {
    heap.retain(a);
    let link = heap.alloc_link(a, None);
    heap.alloc_list(Some(link))
}

/// `(a b)`
pub fn make2(heap: &mut Heap, a: ValueId, b: ValueId) -> ValueId {
    heap.retain(a);
    heap.retain(b);
    let second = heap.alloc_link(b, None);
    let first = heap.alloc_link(a, Some(second));
    heap.alloc_list(Some(first))
}

/// `(a b c)`
pub fn make3(heap: &mut Heap, a: ValueId, b: ValueId, c: ValueId) -> ValueId {
    heap.retain(a);
    heap.retain(b);
    heap.retain(c);
    let third = heap.alloc_link(c, None);
    let second = heap.alloc_link(b, Some(third));
    let first = heap.alloc_link(a, Some(second));
    heap.alloc_list(Some(first))
}

/// Prepend `first` onto `rest`. A list tail shares its spine; a non-list
/// tail becomes a final element, as in the original dialect.
pub fn cons(heap: &mut Heap, first: ValueId, rest: ValueId) -> ValueId {
    heap.retain(first);
    let rest_head = match heap.value(rest) {
        Value::List(head) => Some(*head),
        _ => None,
    };
    let tail = match rest_head {
        Some(head) => {
            if let Some(link) = head {
                heap.retain_link(link);
            }
            head
        }
        None => {
            heap.retain(rest);
            Some(heap.alloc_link(rest, None))
        }
    };
    let link = heap.alloc_link(first, tail);
    heap.alloc_list(Some(link))
}

/// First element of a non-empty list.
pub fn car(heap: &mut Heap, list: ValueId) -> Option<ValueId> {
    let head = heap.value(list).head()?;
    let item = heap.link(head).item;
    heap.retain(item);
    Some(item)
}

/// The list after its first element; the empty singleton when the spine
/// ends.
pub fn cdr(heap: &mut Heap, list: ValueId) -> Option<ValueId> {
    let head = heap.value(list).head()?;
    match heap.link(head).next {
        None => {
            let empty = heap.empty();
            heap.retain(empty);
            Some(empty)
        }
        Some(next) => {
            heap.retain_link(next);
            Some(heap.alloc_list(Some(next)))
        }
    }
}

/// Number of elements in a list spine.
#[must_use]
pub fn len(heap: &Heap, list: ValueId) -> usize {
    let mut count = 0;
    let mut current = heap.value(list).head();
    while let Some(link) = current {
        count += 1;
        current = heap.link(link).next;
    }
    count
}

/// Collect the element handles of a list without retaining them; the
/// handles stay valid while the caller keeps the list alive.
#[must_use]
pub fn elements(heap: &Heap, list: ValueId) -> Vec<ValueId> {
    let mut items = Vec::new();
    let mut current = heap.value(list).head();
    while let Some(link) = current {
        let cell = heap.link(link);
        items.push(cell.item);
        current = cell.next;
    }
    items
}

/// Borrowed n-th element of a list spine.
#[must_use]
pub fn nth(heap: &Heap, list: ValueId, n: usize) -> Option<ValueId> {
    let mut current = heap.value(list).head();
    let mut index = 0;
    while let Some(link) = current {
        let cell = heap.link(link);
        if index == n {
            return Some(cell.item);
        }
        index += 1;
        current = cell.next;
    }
    None
}

/// Build a list value from element handles, retaining each.
pub fn from_slice(heap: &mut Heap, items: &[ValueId]) -> ValueId {
    let mut tail: Option<BoxId> = None;
    for &item in items.iter().rev() {
        heap.retain(item);
        tail = Some(heap.alloc_link(item, tail));
    }
    heap.alloc_list(tail)
}

/// Association-list lookup: the value of the first pair whose key equals
/// `key`, or `None`. Malformed entries are skipped.
pub fn lookup(heap: &mut Heap, key: ValueId, alist: ValueId) -> Option<ValueId> {
    let mut current = heap.value(alist).head();
    while let Some(link) = current {
        let cell = heap.link(link);
        if let Some(pair_head) = heap.value(cell.item).head() {
            let pair = heap.link(pair_head);
            if let Some(value_link) = pair.next {
                if node::equal(heap, key, pair.item) {
                    let value = heap.link(value_link).item;
                    heap.retain(value);
                    return Some(value);
                }
            }
        }
        current = cell.next;
    }
    None
}

/// Association-list lookup with in-place replacement of the matched
/// pair's value, used by `set!` and the three-argument `assoc`. Returns
/// whether a pair was replaced.
pub fn lookup_replace(heap: &mut Heap, key: ValueId, alist: ValueId, replacement: ValueId) -> bool {
    let mut current = heap.value(alist).head();
    while let Some(link) = current {
        let cell = heap.link(link);
        if let Some(pair_head) = heap.value(cell.item).head() {
            let pair = heap.link(pair_head);
            if let Some(value_link) = pair.next {
                if node::equal(heap, key, pair.item) {
                    heap.retain(replacement);
                    heap.set_link_item(value_link, replacement);
                    return true;
                }
            }
        }
        current = cell.next;
    }
    false
}

/// Structural substitution: rewrite `expr`, replacing atoms equal to
/// `old` with `new`. Lists are rebuilt element by element; an expression
/// without occurrences comes back structurally equal to the input.
pub fn substitute(heap: &mut Heap, old: ValueId, new: ValueId, expr: ValueId) -> ValueId {
    if heap.value(expr).is_atom() {
        let chosen = if node::equal(heap, expr, old) { new } else { expr };
        heap.retain(chosen);
        return chosen;
    }
    let children = elements(heap, expr);
    let mut rebuilt = Vec::with_capacity(children.len());
    for child in children {
        rebuilt.push(substitute(heap, old, new, child));
    }
    let mut tail: Option<BoxId> = None;
    for &item in rebuilt.iter().rev() {
        tail = Some(heap.alloc_link(item, tail));
    }
    heap.alloc_list(tail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Printed;

    fn sym(heap: &mut Heap, s: &str) -> ValueId {
        heap.alloc_value(Value::Symbol(s.into()))
    }

    #[test]
    fn test_cons_car_cdr() {
        let mut heap = Heap::new();
        let one = heap.alloc_value(Value::Int(1));
        let two = heap.alloc_value(Value::Int(2));
        let tail = make1(&mut heap, two);
        let pair = cons(&mut heap, one, tail);
        assert_eq!(Printed::new(&heap, pair).to_string(), "(1 2)");
        let head = car(&mut heap, pair).unwrap();
        assert_eq!(Printed::new(&heap, head).to_string(), "1");
        let rest = cdr(&mut heap, pair).unwrap();
        assert_eq!(Printed::new(&heap, rest).to_string(), "(2)");
        let empty = cdr(&mut heap, rest).unwrap();
        assert_eq!(empty, heap.empty());
    }

    #[test]
    fn test_assoc_lookup_and_replace() {
        let mut heap = Heap::new();
        let k = sym(&mut heap, "x");
        let v = heap.alloc_value(Value::Int(10));
        let pair = make2(&mut heap, k, v);
        let empty = heap.empty();
        let env = cons(&mut heap, pair, empty);

        let k2 = sym(&mut heap, "x");
        let found = lookup(&mut heap, k2, env).unwrap();
        assert!(node::equal(&heap, found, v));

        let v2 = heap.alloc_value(Value::Int(20));
        assert!(lookup_replace(&mut heap, k2, env, v2));
        let found = lookup(&mut heap, k2, env).unwrap();
        assert!(node::equal(&heap, found, v2));

        let missing = sym(&mut heap, "y");
        assert!(lookup(&mut heap, missing, env).is_none());
    }

    #[test]
    fn test_substitute_rewrites_atoms() {
        let mut heap = Heap::new();
        let a = sym(&mut heap, "a");
        let b = sym(&mut heap, "b");
        let c = sym(&mut heap, "c");
        let inner = make2(&mut heap, a, c);
        let expr = make2(&mut heap, a, inner);
        let out = substitute(&mut heap, a, b, expr);
        assert_eq!(Printed::new(&heap, out).to_string(), "(b (b c))");
    }

    #[test]
    fn test_substitute_without_occurrence_is_equal() {
        let mut heap = Heap::new();
        let a = sym(&mut heap, "a");
        let b = sym(&mut heap, "b");
        let x = sym(&mut heap, "x");
        let y = sym(&mut heap, "y");
        let expr = make2(&mut heap, x, y);
        let out = substitute(&mut heap, a, b, expr);
        assert_eq!(
            Printed::new(&heap, out).to_string(),
            Printed::new(&heap, expr).to_string()
        );
    }
}
