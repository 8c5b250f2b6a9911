// Integration test: parse all .pas test programs.
use std::fs;
use std::path::Path;

fn parse_file(name: &str) {
    let full_path = Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .unwrap()
        .parent()
        .unwrap()
        .join("tests/pas")
        .join(name);
    let source = fs::read_to_string(&full_path)
        .unwrap_or_else(|e| panic!("Could not read {}: {}", full_path.display(), e));
    let _unit = pascal_parser::parse(name, &source)
        .unwrap_or_else(|e| panic!("Parse error in {}: {}", name, e));
}

#[test]
fn parse_hello() {
    parse_file("hello.pas");
}
#[test]
fn parse_fib() {
    parse_file("fib.pas");
}
#[test]
fn parse_sets() {
    parse_file("sets.pas");
}
#[test]
fn parse_nested() {
    parse_file("nested.pas");
}
#[test]
fn parse_virtual() {
    parse_file("virtual.pas");
}
#[test]
fn parse_fordownto() {
    parse_file("fordownto.pas");
}
#[test]
fn parse_records() {
    parse_file("records.pas");
}
#[test]
fn parse_pointers() {
    parse_file("pointers.pas");
}
#[test]
fn parse_case() {
    parse_file("case.pas");
}
#[test]
fn parse_strings() {
    parse_file("strings.pas");
}
#[test]
fn parse_files() {
    parse_file("files.pas");
}
#[test]
fn parse_mathfns() {
    parse_file("mathfns.pas");
}
#[test]
fn parse_matrix() {
    parse_file("matrix.pas");
}
