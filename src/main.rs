use std::io::{self, Write};

use seedlisp::node::Printed;
use seedlisp::{Heap, Scanner, Vm, reader};

fn main() -> io::Result<()> {
    let mut heap = Heap::new();
    let mut vm = Vm::new(&mut heap);

    // Previous iteration's expression and result stay rooted until the
    // next sweep so `read`-produced structure survives one turn.
    let mut last_input = heap.empty();
    let mut last_output = heap.empty();
    heap.retain(last_input);
    heap.retain(last_output);

    let mut stdout = io::stdout();

    loop {
        heap.process_deletions();
        let roots = [
            heap.truth(),
            heap.falsity(),
            heap.empty(),
            vm.global_env(),
            last_input,
            last_output,
        ];
        heap.sweep(&roots);

        #[cfg(feature = "heap-report")]
        {
            println!("free: {}", heap.stats().free_bytes());
        }

        print!("> ");
        stdout.flush()?;

        // The lock is scoped so `(read)` can take it again during eval.
        let read = {
            let mut input = io::stdin().lock();
            reader::read_expression(&mut input)?
        };
        let Some(text) = read else {
            break;
        };
        if text.trim().is_empty() {
            continue;
        }

        let mut scanner = Scanner::new(&text);
        let expr = match reader::parse(&mut heap, &mut scanner) {
            Ok(expr) => expr,
            Err(_) => {
                println!("Error reading expression");
                continue;
            }
        };
        heap.release(last_input);
        last_input = expr;

        match vm.eval(&mut heap, expr) {
            Ok(result) => {
                println!("{}", Printed::new(&heap, result));
                heap.release(last_output);
                last_output = result;
            }
            Err(err) => println!("{err}"),
        }
    }

    println!();
    Ok(())
}
