use seedlisp::node::Printed;
use seedlisp::{Heap, Scanner, Value, Vm, list, parse};

/// Live slot counts with the three canonical singletons excluded.
fn live_beyond_singletons(heap: &Heap) -> (usize, usize) {
    let stats = heap.stats();
    (stats.live_values() - 3, stats.live_links())
}

#[test]
fn test_singletons_share_identity() {
    let mut heap = Heap::new();
    let t1 = heap.alloc_value(Value::Boolean(true));
    let t2 = heap.boolean(true);
    assert_eq!(t1, t2);
    assert_eq!(t1, heap.truth());
    let e1 = heap.alloc_value(Value::List(None));
    assert_eq!(e1, heap.empty());
    heap.release(t1);
    heap.release(t2);
    heap.release(e1);
    heap.process_deletions();
    assert!(heap.is_live(heap.truth()));
    assert!(heap.is_live(heap.empty()));
}

#[test]
fn test_refcount_frees_unreferenced_values() {
    let mut heap = Heap::new();
    let n = heap.alloc_value(Value::Int(7));
    assert_eq!(heap.value_refs(n), Some(1));
    heap.retain(n);
    assert_eq!(heap.value_refs(n), Some(2));
    heap.release(n);
    heap.release(n);
    heap.process_deletions();
    assert!(!heap.is_live(n));
    assert_eq!(live_beyond_singletons(&heap), (0, 0));
}

#[test]
fn test_shared_tail_survives_head_release() {
    let mut heap = Heap::new();
    let one = heap.alloc_value(Value::Int(1));
    let two = heap.alloc_value(Value::Int(2));
    let tail = list::make1(&mut heap, two);
    let longer = list::cons(&mut heap, one, tail);
    heap.release(one);
    heap.release(two);
    // Dropping the longer list must leave the shared tail intact.
    heap.release(longer);
    heap.process_deletions();
    assert_eq!(Printed::new(&heap, tail).to_string(), "(2)");
    heap.release(tail);
    heap.process_deletions();
    assert_eq!(live_beyond_singletons(&heap), (0, 0));
}

#[test]
fn test_long_list_collapse_drains_iteratively() {
    let mut heap = Heap::new();
    let mut lst = heap.empty();
    heap.retain(lst);
    for i in 0..10_000 {
        let n = heap.alloc_value(Value::Int(i));
        let extended = list::cons(&mut heap, n, lst);
        heap.release(n);
        heap.release(lst);
        lst = extended;
    }
    let stats = heap.stats();
    assert!(stats.live_values() > 10_000);
    // One release collapses the whole chain through the deferred queue;
    // the queue holds 256 entries, so cascades must drain in the loop.
    heap.release(lst);
    heap.process_deletions();
    assert_eq!(live_beyond_singletons(&heap), (0, 0));
}

#[test]
fn test_sweep_reclaims_unrooted_slots() {
    let mut heap = Heap::new();
    let a = heap.alloc_value(Value::Int(1));
    let b = heap.alloc_value(Value::Int(2));
    let kept = list::make1(&mut heap, b);
    // Simulate a leak: forget `a` without releasing it.
    let _ = a;
    let roots = [heap.truth(), heap.falsity(), heap.empty(), kept];
    let reclaimed = heap.sweep(&roots);
    assert!(reclaimed >= 1);
    assert!(!heap.is_live(a));
    assert_eq!(Printed::new(&heap, kept).to_string(), "(2)");
    heap.release(b);
    heap.release(kept);
    heap.process_deletions();
}

#[test]
fn test_sweep_reclaims_reference_cycle() {
    let mut heap = Heap::new();
    let key = heap.alloc_value(Value::Symbol("self".into()));
    let zero = heap.alloc_value(Value::Int(0));
    let pair = list::make2(&mut heap, key, zero);
    let empty = heap.empty();
    let env = list::cons(&mut heap, pair, empty);
    // Close the cycle: the pair's value becomes the list containing it.
    assert!(list::lookup_replace(&mut heap, key, env, env));
    heap.release(key);
    heap.release(zero);
    heap.release(pair);
    // The cycle keeps itself alive through reference counts alone.
    heap.release(env);
    heap.process_deletions();
    assert!(heap.is_live(env));
    // The sweep traces only the roots and reclaims the loop.
    let roots = [heap.truth(), heap.falsity(), heap.empty()];
    heap.sweep(&roots);
    assert!(!heap.is_live(env));
    assert_eq!(live_beyond_singletons(&heap), (0, 0));
}

#[test]
fn test_sweep_after_rebinding_reclaims_old_value() {
    let mut heap = Heap::new();
    let mut vm = Vm::new(&mut heap);
    let mut run = |heap: &mut Heap, vm: &mut Vm, text: &str| {
        let mut scanner = Scanner::new(text);
        let expr = parse(heap, &mut scanner).unwrap();
        let result = vm.eval(heap, expr).unwrap();
        heap.release(result);
        heap.release(expr);
        heap.process_deletions();
    };
    run(&mut heap, &mut vm, "(define x '(1 2 3))");
    let populated = heap.stats().live_values();
    run(&mut heap, &mut vm, "(set! x #f)");
    let roots = [heap.truth(), heap.falsity(), heap.empty(), vm.global_env()];
    heap.sweep(&roots);
    // The three list cells are gone, one way or the other.
    assert!(heap.stats().live_values() <= populated - 3);
}

#[test]
fn test_stats_report_free_slots() {
    let mut heap = Heap::new();
    let before = heap.stats();
    assert_eq!(before.live_values(), 3);
    assert!(before.free_bytes() > 0);
    let held: Vec<_> = (0..50).map(|i| heap.alloc_value(Value::Int(i))).collect();
    let during = heap.stats();
    assert_eq!(during.live_values(), 53);
    assert_eq!(during.value_slots_free, during.value_slots - 53);
    assert!(during.free_bytes() < before.free_bytes());
    for id in held {
        heap.release(id);
    }
    heap.process_deletions();
    assert_eq!(heap.stats().live_values(), 3);
}
