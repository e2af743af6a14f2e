#![no_main]

use charon_compiler::lexer::Lexer;
use charon_compiler::token::Token;
use libfuzzer_sys::fuzz_target;

// The lexer must never panic: arbitrary bytes either tokenize or produce a
// lexical error.
fuzz_target!(|data: &[u8]| {
    let mut lexer = Lexer::new(data);
    for _ in 0..100_000 {
        match lexer.advance() {
            Ok(st) if st.token == Token::Eof => break,
            Ok(_) => {}
            Err(_) => break,
        }
    }
});
