//! Bridge Performance Benchmarks
//!
//! Run with: cargo bench --bench bridge_bench

use std::hint::black_box;
use std::sync::Arc;
use std::time::Instant;

use script_bridge::{Bridge, MethodSuite, VM, push_host_function, push_host_object};

// Simple timing macro for benchmarks
macro_rules! bench {
    ($name:expr, $iterations:expr, $code:block) => {{
        let start = Instant::now();
        for _ in 0..$iterations {
            black_box($code);
        }
        let elapsed = start.elapsed();
        let per_iter = elapsed / $iterations;
        println!(
            "{}: {} iterations in {:?} ({:?}/iter, {:.0} ops/sec)",
            $name,
            $iterations,
            elapsed,
            per_iter,
            $iterations as f64 / elapsed.as_secs_f64()
        );
        elapsed
    }};
}

fn add(vm: &mut VM) -> i32 {
    let sum = vm.get_number(0) + vm.get_number(1);
    vm.push_number(sum);
    1
}

fn main() {
    println!("==============================================");
    println!("  Host Reference Bridge Benchmarks");
    println!("==============================================\n");

    let bridge = Arc::new(Bridge::new());

    // Register, lookup and release through the table alone
    {
        let mut vm = VM::with_bridge(bridge.clone());
        bench!("push_host_object", 10_000u32, {
            push_host_object(&mut vm, Arc::new(0u64)).ok();
            vm.pop();
        });
        vm.gc();
        println!("table after collection: {} entries\n", bridge.table().len());
    }

    // Script to host calls through the call trampoline
    {
        let mut vm = VM::with_bridge(bridge.clone());
        push_host_function(&mut vm, add).ok();
        vm.put_global_string("add");
        bench!("script loop calling host add x1000", 100u32, {
            let ok = vm
                .peval_string("var s = 0; for (var i = 0; i < 1000; i++) { s = add(s, i); } s")
                .is_success();
            vm.pop();
            ok
        });
        println!();
    }

    // Full suite evaluation, including bridging every method afresh
    {
        let suite = MethodSuite::new()
            .with("add", add)
            .with("noop", |_vm: &mut VM| 0);
        let mut vm = VM::with_bridge(bridge.clone());
        bench!("eval_with_suite", 1_000u32, {
            let result = vm.eval_with_suite("function(api) { return api.add(1, 2); }", &suite);
            vm.pop();
            result.is_ok()
        });
    }

    println!("\nBenchmarks complete. {} entries live.", bridge.table().len());
}
