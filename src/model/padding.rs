use burn::prelude::*;

/// Leading/trailing padding that grows `size` to the next multiple of `multiple`.
///
/// An odd deficit puts the extra element on the trailing edge.
pub fn center_pad_amounts(size: usize, multiple: usize) -> (usize, usize) {
    assert!(multiple > 0, "padding multiple must be positive");
    let target = size.div_ceil(multiple) * multiple;
    let deficit = target - size;
    let leading = deficit / 2;
    (leading, deficit - leading)
}

/// Zero-pads the two spatial axes of an `NCHW` tensor so each is a multiple of `multiple`,
/// centering the existing content. Already aligned inputs are returned untouched.
pub fn pad_to_multiple<B: Backend>(input: Tensor<B, 4>, multiple: usize) -> Tensor<B, 4> {
    let [batch, channels, height, width] = input.dims();
    let (top, bottom) = center_pad_amounts(height, multiple);
    let (left, right) = center_pad_amounts(width, multiple);
    if top + bottom + left + right == 0 {
        return input;
    }

    let device = input.device();
    Tensor::<B, 4>::zeros(
        [batch, channels, height + top + bottom, width + left + right],
        &device,
    )
    .slice_assign(
        [
            0..batch,
            0..channels,
            top..top + height,
            left..left + width,
        ],
        input,
    )
}
