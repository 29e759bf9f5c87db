fn main() -> std::process::ExitCode {
    media_downloader::run()
}
