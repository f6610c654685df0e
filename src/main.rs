fn main() {
    labeler_lib::run()
}
