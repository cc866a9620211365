fn main() -> anyhow::Result<()> {
    cmk_jobs::bj::main()
}
