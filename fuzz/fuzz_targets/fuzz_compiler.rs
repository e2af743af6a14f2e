#![no_main]

use charon_compiler::compiler::compile;
use libfuzzer_sys::fuzz_target;

// The compiler must never panic: arbitrary input either compiles or returns
// a CompileError.
fuzz_target!(|data: &[u8]| {
    let _ = compile(data, "fuzz");
});
