use featr::{ConfigError, FrameWindow, WindowError};

#[test]
fn full_window_keeps_the_newest_items_in_recency_order() {
    for capacity in 1..5 {
        let mut window = FrameWindow::new(capacity).unwrap();
        for n in 1..=12 {
            window.push(n);
            let expected_len = n.min(capacity);
            assert_eq!(window.len(), expected_len);

            let by_recency = (0..expected_len)
                .map(|k| *window.by_recency(k).unwrap())
                .collect::<Vec<_>>();
            let expected = (0..expected_len).map(|k| n - k).collect::<Vec<_>>();
            assert_eq!(by_recency, expected);
        }
    }
}

#[test]
fn partially_filled_window_only_exposes_pushed_items() {
    let mut window = FrameWindow::new(4).unwrap();
    assert!(window.is_empty());
    assert_eq!(window.most_recent(), None);
    assert_eq!(window.by_recency(0), Err(WindowError::OutOfRange { offset: 0, len: 0 }));

    window.push('a');
    window.push('b');
    assert_eq!(window.len(), 2);
    assert!(!window.is_full());
    assert_eq!(window.by_recency(0), Ok(&'b'));
    assert_eq!(window.by_recency(1), Ok(&'a'));
    assert_eq!(window.by_recency(2), Err(WindowError::OutOfRange { offset: 2, len: 2 }));
}

#[test]
fn third_push_evicts_the_first_of_a_pair() {
    let mut window = FrameWindow::new(2).unwrap();
    window.push("A");
    window.push("B");
    window.push("C");

    assert_eq!(window.by_recency(0), Ok(&"C"));
    assert_eq!(window.by_recency(1), Ok(&"B"));
    assert!(window.iter_by_recency().all(|item| *item != "A"));
}

#[test]
fn pair_mut_rejects_aliasing() {
    let mut window = FrameWindow::new(2).unwrap();
    window.push(1);
    window.push(2);
    assert_eq!(window.pair_mut(0, 0).err(), Some(WindowError::Aliased(0)));

    let (previous, current) = window.pair_mut(1, 0).unwrap();
    *current += *previous;
    assert_eq!(window.most_recent(), Some(&3));
}

#[test]
fn zero_capacity_is_a_configuration_error() {
    assert!(matches!(FrameWindow::<u8>::new(0), Err(ConfigError::InvalidCapacity(0))));
}
