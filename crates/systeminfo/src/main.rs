fn main() {
    let topology = systeminfo::topology().expect("failed to read cpu topology");
    let json = serde_json::to_string_pretty(&topology).unwrap();

    println!("{json}");
}
