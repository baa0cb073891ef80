use burn::prelude::*;

/// Gradient-reversal layer.
///
/// The forward value is `x` unchanged. During backpropagation the gradient
/// reaching `x` through this node is `-weight * g`, so a single optimizer step
/// descends the downstream loss for the layers after it and ascends it for the
/// layers before it.
///
/// The output is `x' - z` with `'` marking a detached copy and
/// `z = (s - s') * weight + 0` where `s` is `x` with non-finite entries zeroed.
/// `z` is `+0.0` everywhere, so the subtraction keeps every input bit,
/// signed zeros and infinities included, for any finite `weight`. Only `s`
/// carries a graph edge back to `x`; non-finite inputs receive no gradient.
pub fn grad_reverse<B: Backend, const D: usize>(x: Tensor<B, D>, weight: f64) -> Tensor<B, D> {
    let detached = x.clone().detach();
    let non_finite = detached
        .clone()
        .sub(detached.clone())
        .equal_elem(0.0)
        .bool_not();
    let safe = x.mask_fill(non_finite, 0.0);
    let zero = safe
        .clone()
        .sub(safe.detach())
        .mul_scalar(weight)
        .add_scalar(0.0);
    detached.sub(zero)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};
    use burn::tensor::TensorData;

    type TestBackend = Autodiff<NdArray<f32>>;

    fn input(values: Vec<f32>) -> Tensor<TestBackend, 2> {
        let len = values.len();
        Tensor::from_data(TensorData::new(values, [1, len]), &Default::default())
    }

    fn bits(tensor: Tensor<TestBackend, 2>) -> Vec<u32> {
        tensor
            .into_data()
            .to_vec::<f32>()
            .expect("f32 data")
            .into_iter()
            .map(f32::to_bits)
            .collect()
    }

    #[test]
    fn forward_is_bitwise_identity() {
        let values = vec![1.5, -2.25, 0.0, -0.0, 1e-30, -3.4e5, 7.0];
        for weight in [0.0, 0.2, 1.0, 13.5] {
            let x = input(values.clone());
            let y = grad_reverse(x.clone(), weight);
            assert_eq!(bits(y), bits(x), "weight {weight}");
        }
    }

    #[test]
    fn forward_keeps_infinities_and_overflowing_products() {
        let values = vec![3e38, -3e38, f32::INFINITY, f32::NEG_INFINITY, f32::MAX, -0.0, -1.0];
        for weight in [0.0, 1.0, 2.0, 1e10, -1.5] {
            let x = input(values.clone()).require_grad();
            let y = grad_reverse(x.clone(), weight);
            assert_eq!(bits(y), bits(x), "weight {weight}");
        }
    }

    #[test]
    fn large_finite_inputs_still_get_the_reversed_gradient() {
        let x = input(vec![3e38, -1e30, 5.0]).require_grad();
        let y = grad_reverse(x.clone(), 2.0);
        let grads = y.sum().backward();
        let dx = x
            .grad(&grads)
            .expect("gradient reaches input")
            .into_data()
            .to_vec::<f32>()
            .expect("f32 data");
        assert_eq!(dx, vec![-2.0, -2.0, -2.0]);
    }

    #[test]
    fn backward_negates_and_scales() {
        let upstream = vec![1.0, -2.0, 0.5, 4.0];
        for weight in [0.25, 1.0, 3.0] {
            let x = input(vec![0.3, -0.7, 1.1, 2.0]).require_grad();
            let g = input(upstream.clone());
            let y = grad_reverse(x.clone(), weight);
            let grads = y.mul(g).sum().backward();
            let dx = x
                .grad(&grads)
                .expect("gradient reaches input")
                .into_data()
                .to_vec::<f32>()
                .expect("f32 data");
            for (got, g) in dx.iter().zip(&upstream) {
                let expected = -(weight as f32) * g;
                assert!((got - expected).abs() < 1e-6, "{got} vs {expected}");
            }
        }
    }

    #[test]
    fn zero_weight_blocks_the_gradient() {
        let x = input(vec![0.3, -0.7, 1.1]).require_grad();
        let y = grad_reverse(x.clone(), 0.0);
        let grads = y.mul_scalar(5.0).sum().backward();
        let dx = x
            .grad(&grads)
            .expect("gradient reaches input")
            .into_data()
            .to_vec::<f32>()
            .expect("f32 data");
        assert!(dx.iter().all(|v| *v == 0.0), "{dx:?}");
    }
}
