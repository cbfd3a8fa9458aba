use blockheap::UnixAllocator;

#[global_allocator]
static ALLOCATOR: UnixAllocator = UnixAllocator::new();

fn main() {
    let greeting = String::from("Hello, World!");
    println!("{}", greeting);
    println!("{:?}", ALLOCATOR.stats());
}
