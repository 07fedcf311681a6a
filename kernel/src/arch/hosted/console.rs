pub fn write_str(s: &str) {
    std::eprint!("{}", s);
}
