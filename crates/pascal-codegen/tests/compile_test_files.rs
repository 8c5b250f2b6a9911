// Integration test: run the full front end and code generator over
// the .pas corpus. Every emitted function passes Cranelift's
// verifier inside `compile`, so a non-empty object file means the IR
// was well formed.
use std::fs;
use std::path::Path;

fn compile_file(name: &str) -> Vec<u8> {
    let full_path = Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .unwrap()
        .parent()
        .unwrap()
        .join("tests/pas")
        .join(name);
    let source = fs::read_to_string(&full_path)
        .unwrap_or_else(|e| panic!("Could not read {}: {}", full_path.display(), e));
    let mut unit = pascal_parser::parse(name, &source)
        .unwrap_or_else(|e| panic!("Parse error in {}: {}", name, e));
    pascal_sema::closure_transform(&mut unit.program);
    pascal_codegen::compile(&unit.program, &unit.arena)
        .unwrap_or_else(|e| panic!("Codegen error in {}: {}", name, e))
}

fn check(name: &str) {
    let obj = compile_file(name);
    assert!(!obj.is_empty(), "{} produced an empty object", name);
}

#[test]
fn compile_hello() {
    check("hello.pas");
}
#[test]
fn compile_fib() {
    check("fib.pas");
}
#[test]
fn compile_sets() {
    check("sets.pas");
}
#[test]
fn compile_nested() {
    check("nested.pas");
}
#[test]
fn compile_virtual() {
    check("virtual.pas");
}
#[test]
fn compile_fordownto() {
    check("fordownto.pas");
}
#[test]
fn compile_records() {
    check("records.pas");
}
#[test]
fn compile_pointers() {
    check("pointers.pas");
}
#[test]
fn compile_case() {
    check("case.pas");
}
#[test]
fn compile_strings() {
    check("strings.pas");
}
#[test]
fn compile_files() {
    check("files.pas");
}
#[test]
fn compile_mathfns() {
    check("mathfns.pas");
}
#[test]
fn compile_matrix() {
    check("matrix.pas");
}
