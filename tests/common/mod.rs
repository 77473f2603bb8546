use ionscript::Runtime;

/// Compiles and runs `src` against a fresh `Runtime`, returning whatever it
/// wrote to its injected text sink as a `String`.
pub fn run_source(src: &str) -> String {
    let mut runtime = Runtime::new();
    let mut out = Vec::new();
    runtime.compile_and_run(src, &mut out).expect("script should run to completion");
    String::from_utf8(out).expect("script output should be valid utf-8")
}
