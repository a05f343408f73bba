use criterion::Criterion;

mod sharing;

fn main() {
    let mut c = Criterion::default().configure_from_args();

    sharing::sharing_benchmark(&mut c);

    c.final_summary();
}
