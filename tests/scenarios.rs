mod common;

use common::run_source;

#[test]
fn prints_sum_of_two_literals() {
    assert_eq!(run_source("print(1 + 2)"), "3\n");
}

#[test]
fn recursive_factorial() {
    let src = "def fact(n) if n <= 1 return 1 end return n * fact(n-1) end print(fact(6))";
    assert_eq!(run_source(src), "720\n");
}

#[test]
fn list_append_and_len() {
    assert_eq!(run_source("a = [1, 2, 3] append(a, 4) print(len(a))"), "4\n");
}

#[test]
fn dictionary_read_and_write() {
    let src = r#"d = {"x": 1} d["y"] = 2 print(d["x"] + d["y"])"#;
    assert_eq!(run_source(src), "3\n");
}

#[test]
fn while_loop_accumulates_sum() {
    let src = "i = 0 s = 0 while i < 10 s += i i += 1 end print(s)";
    assert_eq!(run_source(src), "45\n");
}

#[test]
fn for_loop_breaks_at_three() {
    let src = "for i = 0; i < 5; i += 1 if i == 3 break end print(i) end";
    assert_eq!(run_source(src), "0\n1\n2\n");
}
