fn main() -> anyhow::Result<()> {
    gazectl::logging::init();
    gazectl::cli::run()
}
