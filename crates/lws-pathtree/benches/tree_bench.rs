use criterion::{black_box, criterion_group, criterion_main, Criterion};
use lws_pathtree::{PathTree, SubTreeOptions};

fn build_tree(folders: usize, files: usize) -> PathTree<usize> {
    let mut tree = PathTree::new('/');
    for f in 0..folders {
        for i in 0..files {
            tree.set(&format!("$/Proj/dir{}/file{}.txt", f, i), f * files + i);
        }
    }
    tree
}

fn bench_lookup(c: &mut Criterion) {
    let tree = build_tree(100, 100);
    c.bench_function("pathtree_get_10k", |b| {
        b.iter(|| tree.get(black_box("$/proj/DIR57/file42.txt")))
    });
}

fn bench_subtree(c: &mut Criterion) {
    let tree = build_tree(100, 100);
    c.bench_function("pathtree_subtree_one_folder", |b| {
        b.iter(|| {
            tree.subtree(black_box("$/Proj/dir10"), SubTreeOptions::WITH_ROOT, usize::MAX)
                .count()
        })
    });
}

fn bench_ancestors(c: &mut Criterion) {
    let tree = build_tree(100, 100);
    c.bench_function("pathtree_nearest_ancestor", |b| {
        b.iter(|| tree.get_nearest(black_box("$/Proj/dir10/file5.txt/missing/deeper")))
    });
}

criterion_group!(benches, bench_lookup, bench_subtree, bench_ancestors);
criterion_main!(benches);
